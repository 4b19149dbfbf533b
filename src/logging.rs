use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing stack for the daemon.
///
/// Returns the appender guard when file logging is enabled; dropping it
/// flushes and stops the background writer, so the caller holds it for the
/// process lifetime.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer_parts = match &config.file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .context("log file path has no file name")?;
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };
    let (file_writer, guard) = file_layer_parts;

    let console_layer = fmt::layer().with_target(true);

    if config.json {
        let registry = Registry::default()
            .with(env_filter)
            .with(console_layer.json().flatten_event(true));
        match file_writer {
            Some(writer) => registry
                .with(fmt::layer().json().with_ansi(false).with_writer(writer))
                .init(),
            None => registry.init(),
        }
    } else {
        let registry = Registry::default().with(env_filter).with(console_layer);
        match file_writer {
            Some(writer) => registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init(),
            None => registry.init(),
        }
    }

    Ok(guard)
}
