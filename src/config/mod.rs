use crate::error::ConfigError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level daemon configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConductorConfig {
    /// Public IP of the control-plane machine, used for proxy wiring
    pub control_plane_ip: Ipv4Addr,
    /// Node id for the control-plane worker; defaults to the machine hostname
    #[serde(default)]
    pub control_plane_node_id: Option<String>,
    /// RAM the control-plane node offers to workloads
    #[serde(default = "default_control_plane_ram_mb")]
    pub control_plane_ram_mb: u64,
    #[serde(default = "default_control_plane_cpu")]
    pub control_plane_cpu: u32,

    pub ssh_private_key_path: PathBuf,
    /// Key id uploaded at the cloud provider, injected into new VMs
    pub ssh_key_id: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// Cloud API credential; absence disables scaling entirely
    pub cloud_token: Option<String>,
    #[serde(default = "default_cloud_api_url")]
    pub cloud_api_url: String,
    #[serde(default)]
    pub scaling_enabled: bool,
    #[serde(default)]
    pub cost_optimisation_enabled: bool,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_scale_interval_secs")]
    pub scale_interval_secs: u64,
    #[serde(default = "default_proxy_health_interval_secs")]
    pub proxy_health_interval_secs: u64,
    #[serde(default = "default_idle_cooldown_secs")]
    pub idle_cooldown_secs: u64,
    /// Consecutive failed probes before an unhealthy node is drained
    #[serde(default = "default_unhealthy_evict_probes")]
    pub unhealthy_evict_probes: u32,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Inclusive host-port range handed to workloads
    #[serde(default = "default_mc_port_range")]
    pub mc_port_range: [u16; 2],

    pub proxy_api_url: String,
    /// Container image every workload runs
    #[serde(default = "default_workload_image")]
    pub workload_image: String,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// When set, logs are also appended to this file (daily rotation)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

fn default_control_plane_ram_mb() -> u64 {
    8192
}
fn default_control_plane_cpu() -> u32 {
    4
}
fn default_ssh_user() -> String {
    "root".to_string()
}
fn default_cloud_api_url() -> String {
    "https://api.cloud.example.com/v1".to_string()
}
fn default_health_interval_secs() -> u64 {
    10
}
fn default_scale_interval_secs() -> u64 {
    120
}
fn default_proxy_health_interval_secs() -> u64 {
    30
}
fn default_idle_cooldown_secs() -> u64 {
    600
}
fn default_unhealthy_evict_probes() -> u32 {
    12
}
fn default_shutdown_grace_secs() -> u64 {
    15
}
fn default_mc_port_range() -> [u16; 2] {
    [25600, 25700]
}
fn default_workload_image() -> String {
    "itzg/minecraft-server:latest".to_string()
}
fn default_database_path() -> PathBuf {
    PathBuf::from("conductor.db")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl ConductorConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {:?}", path.as_ref()))?;

        let config: ConductorConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config")?;

        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config at {:?}", path.as_ref()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let [start, end] = self.mc_port_range;
        if start > end {
            return Err(ConfigError::Invalid {
                reason: format!("mc_port_range start {start} is above end {end}"),
            });
        }
        for (name, value) in [
            ("health_interval_secs", self.health_interval_secs),
            ("scale_interval_secs", self.scale_interval_secs),
            (
                "proxy_health_interval_secs",
                self.proxy_health_interval_secs,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    reason: format!("{name} must be non-zero"),
                });
            }
        }
        if self.scaling_enabled && self.cloud_token.is_none() {
            return Err(ConfigError::MissingField {
                field: "cloud_token".to_string(),
            });
        }
        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_secs(self.scale_interval_secs)
    }

    pub fn proxy_health_interval(&self) -> Duration {
        Duration::from_secs(self.proxy_health_interval_secs)
    }

    pub fn idle_cooldown(&self) -> Duration {
        Duration::from_secs(self.idle_cooldown_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Per-probe deadline; half the tick so a full round always fits.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs((self.health_interval_secs / 2).max(1))
    }
}

/// Produce a fully commented-out-free starter config for `conductor config example`.
pub fn create_example_config() -> ConductorConfig {
    ConductorConfig {
        control_plane_ip: Ipv4Addr::new(203, 0, 113, 10),
        control_plane_node_id: Some("local-node".to_string()),
        control_plane_ram_mb: default_control_plane_ram_mb(),
        control_plane_cpu: default_control_plane_cpu(),
        ssh_private_key_path: PathBuf::from("/etc/conductor/id_ed25519"),
        ssh_key_id: "conductor-fleet".to_string(),
        ssh_user: default_ssh_user(),
        cloud_token: None,
        cloud_api_url: default_cloud_api_url(),
        scaling_enabled: false,
        cost_optimisation_enabled: false,
        health_interval_secs: default_health_interval_secs(),
        scale_interval_secs: default_scale_interval_secs(),
        proxy_health_interval_secs: default_proxy_health_interval_secs(),
        idle_cooldown_secs: default_idle_cooldown_secs(),
        unhealthy_evict_probes: default_unhealthy_evict_probes(),
        shutdown_grace_secs: default_shutdown_grace_secs(),
        mc_port_range: default_mc_port_range(),
        proxy_api_url: "http://127.0.0.1:8080".to_string(),
        workload_image: default_workload_image(),
        database_path: default_database_path(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_round_trips_through_toml() {
        let config = create_example_config();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ConductorConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.mc_port_range, config.mc_port_range);
        assert_eq!(parsed.proxy_api_url, config.proxy_api_url);
    }

    #[test]
    fn scaling_without_token_is_rejected() {
        let mut config = create_example_config();
        config.scaling_enabled = true;
        assert!(config.validate().is_err());

        config.cloud_token = Some("tok".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let mut config = create_example_config();
        config.mc_port_range = [25700, 25600];
        assert!(config.validate().is_err());
    }
}
