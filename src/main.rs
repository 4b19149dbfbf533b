mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, ConfigCommands};
use conductor::{Conductor, ConductorConfig, create_example_config, logging};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let mut config = ConductorConfig::load(&cli.config)?;
            if cli.verbose {
                config.logging.level = "debug".to_string();
            }
            let _log_guard = logging::init_tracing(&config.logging)?;

            let conductor = Conductor::start(config)
                .await
                .context("conductor failed to start")?;
            info!("conductor is up; press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            conductor.shutdown().await;
        }

        Commands::Config { command } => match command {
            ConfigCommands::Validate => {
                let config = ConductorConfig::load(&cli.config)?;
                println!("✅ {} is valid", cli.config.display());
                println!("   control plane: {}", config.control_plane_ip);
                println!("   proxy API:     {}", config.proxy_api_url);
                println!(
                    "   scaling:       {}",
                    if config.scaling_enabled { "enabled" } else { "disabled" }
                );
                println!(
                    "   port range:    {}-{}",
                    config.mc_port_range[0], config.mc_port_range[1]
                );
            }
            ConfigCommands::Example => {
                let example = create_example_config();
                print!("{}", toml::to_string_pretty(&example)?);
            }
        },
    }

    Ok(())
}
