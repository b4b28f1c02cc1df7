//! Configuration structures and loading

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Directory containing `setup.sh`, `create.sh`, `destroy.sh`.
    pub bin_path: PathBuf,

    /// Directory under which per-container depots (`<depot>/<id>`) live.
    pub depot_path: PathBuf,

    /// Rootfs directory used by the overlay provider.
    pub rootfs_path: PathBuf,

    /// Network pool configuration.
    #[serde(default)]
    pub network: NetworkConfiguration,

    /// UID pool configuration.
    #[serde(default)]
    pub uid_pool: RangeConfiguration,

    /// Port pool configuration.
    #[serde(default)]
    pub port_pool: RangeConfiguration,

    /// Bridge naming configuration.
    #[serde(default)]
    pub bridge: BridgeConfiguration,

    /// Container interface MTU.
    #[serde(default = "default_mtu")]
    pub container_iface_mtu: u32,

    /// Whether nested containers are allowed.
    #[serde(default)]
    pub allow_nested_warden: bool,

    /// Whether disk quota enforcement is enabled (forwarded to `setup.sh`).
    #[serde(default = "default_true")]
    pub disk_quota_enabled: bool,

    /// Time after which an idle container may be reaped.
    #[serde(default = "default_grace_time")]
    pub container_grace_time_secs: u64,
}

impl Configuration {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", path))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "failed to parse configuration")?;

        std::fs::create_dir_all(&config.depot_path)
            .with_context(|| format!("failed to create depot path: {:?}", config.depot_path))?;

        Ok(config)
    }
}

/// Network pool configuration — the single source of truth for both the
/// subnet pool and the `POOL_NETWORK` value passed to `setup.sh`, so the
/// two never diverge.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfiguration {
    /// CIDR of the dynamic subnet range handed out by the subnet pool.
    #[serde(default = "default_pool_network")]
    pub pool_network: String,

    /// Networks containers are allowed to reach (forwarded to `setup.sh`).
    #[serde(default)]
    pub allow_networks: Vec<String>,

    /// Networks containers are denied from reaching (forwarded to `setup.sh`).
    #[serde(default)]
    pub deny_networks: Vec<String>,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            pool_network: default_pool_network(),
            allow_networks: Vec::new(),
            deny_networks: Vec::new(),
        }
    }
}

fn default_pool_network() -> String {
    "10.254.0.0/24".to_string()
}

/// A bounded integer range used by both the UID and port pools.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RangeConfiguration {
    pub start: u32,
    pub size: u32,
}

impl Default for RangeConfiguration {
    fn default() -> Self {
        Self {
            start: 10000,
            size: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfiguration {
    /// Prefix namespacing bridges to this daemon instance (e.g. `"w"`).
    #[serde(default = "default_bridge_tag")]
    pub tag: String,
}

impl Default for BridgeConfiguration {
    fn default() -> Self {
        Self {
            tag: default_bridge_tag(),
        }
    }
}

fn default_bridge_tag() -> String {
    "c".to_string()
}

fn default_mtu() -> u32 {
    1500
}

fn default_true() -> bool {
    true
}

fn default_grace_time() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let depot = dir.path().join("depot");
        let config_path = dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            format!(
                "bin_path = \"/root/path\"\ndepot_path = \"{}\"\nrootfs_path = \"/rootfs/path\"\n",
                depot.display()
            ),
        )
        .unwrap();

        let config = Configuration::load(config_path.to_str().unwrap()).unwrap();
        assert_eq!(config.container_iface_mtu, 1500);
        assert!(config.disk_quota_enabled);
        assert_eq!(config.network.pool_network, "10.254.0.0/24");
        assert!(depot.exists());
    }
}
