//! Network configurator — the host/container wiring invoked from the
//! namespace lifecycle hooks.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use thiserror::Error;

use super::bridge::{BridgeError, BridgeManager};
use super::os::{NetOs, OsError};

#[derive(Error, Debug)]
pub enum ConfiguratorError {
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("os error: {0}")]
    Os(#[from] OsError),
}

pub struct HostConfig {
    pub host_iface: String,
    pub container_iface: String,
    pub bridge_subnet: Ipv4Network,
    pub host_ip: Ipv4Addr,
    pub container_pid: u32,
    pub mtu: u32,
}

pub struct ContainerConfig {
    pub container_iface: String,
    pub container_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub subnet: Ipv4Network,
    pub hostname: String,
    pub mtu: u32,
}

/// Runs in the parent/host namespace, after the child has been cloned
/// but before pivot_root — creates or reuses the bridge, creates the
/// veth pair, moves the container-side end into the child's netns.
pub struct NetworkConfigurator {
    bridges: Arc<BridgeManager>,
    os: Arc<dyn NetOs>,
}

impl NetworkConfigurator {
    pub fn new(bridges: Arc<BridgeManager>, os: Arc<dyn NetOs>) -> Self {
        Self { bridges, os }
    }

    pub async fn configure_host(&self, cfg: &HostConfig) -> Result<String, ConfiguratorError> {
        let bridge = self
            .bridges
            .reserve(cfg.bridge_subnet, cfg.host_ip)
            .await?;

        self.os
            .veth_add(&cfg.host_iface, &cfg.container_iface)
            .await?;
        self.os
            .link_set_netns(&cfg.container_iface, cfg.container_pid)
            .await?;
        self.os.link_set_up(&cfg.host_iface).await?;
        self.os
            .link_set_master(&cfg.host_iface, &bridge)
            .await?;
        self.os.link_set_mtu(&cfg.host_iface, cfg.mtu).await?;
        self.os.link_set_mtu(&cfg.container_iface, cfg.mtu).await?;

        Ok(bridge)
    }

    /// Runs in the child namespace, after pivot_root.
    pub async fn configure_container(&self, cfg: &ContainerConfig) -> Result<(), ConfiguratorError> {
        self.os.set_hostname(&cfg.hostname).await?;
        self.os.link_set_up("lo").await?;
        self.os
            .addr_add(
                &cfg.container_iface,
                &format!("{}/{}", cfg.container_ip, cfg.subnet.prefix()),
            )
            .await?;
        self.os.link_set_up(&cfg.container_iface).await?;
        self.os.link_set_mtu(&cfg.container_iface, cfg.mtu).await?;
        self.os.route_add_default(cfg.gateway_ip).await?;
        Ok(())
    }

    /// Releases the bridge reservation taken by `configure_host`. Called
    /// from the container pool's reverse-order teardown, not from a hook.
    pub async fn release_host(&self, subnet: Ipv4Network) -> Result<(), ConfiguratorError> {
        self.bridges.release(subnet).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingOs {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingOs {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl NetOs for RecordingOs {
        async fn bridge_add(&self, name: &str) -> Result<(), OsError> {
            self.record(format!("bridge_add {name}"));
            Ok(())
        }
        async fn bridge_del(&self, name: &str) -> Result<(), OsError> {
            self.record(format!("bridge_del {name}"));
            Ok(())
        }
        async fn addr_add(&self, device: &str, cidr: &str) -> Result<(), OsError> {
            self.record(format!("addr_add {device} {cidr}"));
            Ok(())
        }
        async fn link_set_up(&self, device: &str) -> Result<(), OsError> {
            self.record(format!("link_set_up {device}"));
            Ok(())
        }
        async fn link_set_mtu(&self, device: &str, mtu: u32) -> Result<(), OsError> {
            self.record(format!("link_set_mtu {device} {mtu}"));
            Ok(())
        }
        async fn link_set_master(&self, device: &str, bridge: &str) -> Result<(), OsError> {
            self.record(format!("link_set_master {device} {bridge}"));
            Ok(())
        }
        async fn link_set_netns(&self, device: &str, pid: u32) -> Result<(), OsError> {
            self.record(format!("link_set_netns {device} {pid}"));
            Ok(())
        }
        async fn veth_add(&self, host_side: &str, container_side: &str) -> Result<(), OsError> {
            self.record(format!("veth_add {host_side} {container_side}"));
            Ok(())
        }
        async fn route_add_default(&self, gateway: Ipv4Addr) -> Result<(), OsError> {
            self.record(format!("route_add_default {gateway}"));
            Ok(())
        }
        async fn set_hostname(&self, hostname: &str) -> Result<(), OsError> {
            self.record(format!("set_hostname {hostname}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn configure_host_creates_bridge_veth_and_moves_container_side() {
        let os = Arc::new(RecordingOs::default());
        let bridges = Arc::new(BridgeManager::new("t", os.clone()));
        let configurator = NetworkConfigurator::new(bridges, os.clone());

        let cfg = HostConfig {
            host_iface: "vethh0".into(),
            container_iface: "vethc0".into(),
            bridge_subnet: "10.254.0.0/30".parse().unwrap(),
            host_ip: "10.254.0.1".parse().unwrap(),
            container_pid: 4242,
            mtu: 1500,
        };

        let bridge = configurator.configure_host(&cfg).await.unwrap();
        assert!(bridge.starts_with("wtb-"));

        let calls = os.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.starts_with("bridge_add")));
        assert!(calls.iter().any(|c| c == "veth_add vethh0 vethc0"));
        assert!(calls
            .iter()
            .any(|c| c == &format!("link_set_netns vethc0 {}", cfg.container_pid)));
    }

    #[tokio::test]
    async fn configure_container_sets_hostname_address_and_default_route() {
        let os = Arc::new(RecordingOs::default());
        let configurator = NetworkConfigurator::new(
            Arc::new(BridgeManager::new("t", os.clone())),
            os.clone(),
        );

        let cfg = ContainerConfig {
            container_iface: "eth0".into(),
            container_ip: "10.254.0.2".parse().unwrap(),
            gateway_ip: "10.254.0.1".parse().unwrap(),
            subnet: "10.254.0.0/30".parse().unwrap(),
            hostname: "abc123".into(),
            mtu: 1500,
        };

        configurator.configure_container(&cfg).await.unwrap();

        let calls = os.calls.lock().unwrap();
        assert!(calls.contains(&"set_hostname abc123".to_string()));
        assert!(calls.contains(&"route_add_default 10.254.0.1".to_string()));
    }
}
