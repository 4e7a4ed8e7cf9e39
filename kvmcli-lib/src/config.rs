// SPDX-License-Identifier: GPL-2.0-only
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    NotFound(std::io::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(e) => write!(f, "config file not found: {e}"),
            ConfigError::Invalid(e) => write!(f, "invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfigError::NotFound(_))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub hypervisor: HypervisorConfig,
    pub overlay: OverlayConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_db_path().to_string_lossy().to_string(),
        }
    }
}

/// Where and how to reach libvirt.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub uri: String,
    /// virsh binary used to drive libvirt
    pub virsh: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        HypervisorConfig {
            uri: "qemu:///system".to_string(),
            virsh: "virsh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub qemu_img: String,
    pub timeout_secs: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            qemu_img: "qemu-img".to_string(),
            timeout_secs: 30,
        }
    }
}

impl OverlayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// First three octets of MACs derived from a VM's IP address
    pub mac_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            mac_prefix: crate::network::DEFAULT_MAC_PREFIX.to_string(),
        }
    }
}

/// Returns the default config file path: $XDG_CONFIG_HOME/kvmcli/kvmcli.yaml
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("kvmcli")
        .join("kvmcli.yaml")
}

/// Returns the default database path: $XDG_STATE_HOME/kvmcli/kvmcli.db
pub fn default_db_path() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("kvmcli")
        .join("kvmcli.db")
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(e)
            } else {
                ConfigError::Invalid(e.to_string())
            }
        })?;
        let config: Config =
            serde_norway::from_str(&content).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.overlay.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "overlay.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
