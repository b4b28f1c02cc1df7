//! Thin OS-interface boundary for link/bridge/address operations.
//!
//! Link/bridge/address operations are wrapped behind a narrow trait so
//! the `ip`/`iproute2` calls can be mocked in tests, rather than pulling
//! in a netlink crate.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum OsError {
    #[error("command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("io error running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Link/bridge/address operations needed by the bridge manager and the
/// network configurator. Implemented against real `ip` invocations in
/// [`IpRoute2`], and fakeable in tests.
#[async_trait]
pub trait NetOs: Send + Sync {
    async fn bridge_add(&self, name: &str) -> Result<(), OsError>;
    async fn bridge_del(&self, name: &str) -> Result<(), OsError>;
    async fn addr_add(&self, device: &str, cidr: &str) -> Result<(), OsError>;
    async fn link_set_up(&self, device: &str) -> Result<(), OsError>;
    async fn link_set_mtu(&self, device: &str, mtu: u32) -> Result<(), OsError>;
    async fn link_set_master(&self, device: &str, bridge: &str) -> Result<(), OsError>;
    async fn link_set_netns(&self, device: &str, pid: u32) -> Result<(), OsError>;
    async fn veth_add(&self, host_side: &str, container_side: &str) -> Result<(), OsError>;
    async fn route_add_default(&self, gateway: Ipv4Addr) -> Result<(), OsError>;
    async fn set_hostname(&self, hostname: &str) -> Result<(), OsError>;
}

/// Real implementation: shells out to `ip` via `tokio::process::Command`.
pub struct IpRoute2;

#[async_trait]
impl NetOs for IpRoute2 {
    async fn bridge_add(&self, name: &str) -> Result<(), OsError> {
        run(&["link", "add", "name", name, "type", "bridge"]).await
    }

    async fn bridge_del(&self, name: &str) -> Result<(), OsError> {
        run(&["link", "delete", name, "type", "bridge"]).await
    }

    async fn addr_add(&self, device: &str, cidr: &str) -> Result<(), OsError> {
        run(&["addr", "add", cidr, "dev", device]).await
    }

    async fn link_set_up(&self, device: &str) -> Result<(), OsError> {
        run(&["link", "set", device, "up"]).await
    }

    async fn link_set_mtu(&self, device: &str, mtu: u32) -> Result<(), OsError> {
        run(&["link", "set", device, "mtu", &mtu.to_string()]).await
    }

    async fn link_set_master(&self, device: &str, bridge: &str) -> Result<(), OsError> {
        run(&["link", "set", device, "master", bridge]).await
    }

    async fn link_set_netns(&self, device: &str, pid: u32) -> Result<(), OsError> {
        run(&["link", "set", device, "netns", &pid.to_string()]).await
    }

    async fn veth_add(&self, host_side: &str, container_side: &str) -> Result<(), OsError> {
        run(&[
            "link",
            "add",
            host_side,
            "type",
            "veth",
            "peer",
            "name",
            container_side,
        ])
        .await
    }

    async fn route_add_default(&self, gateway: Ipv4Addr) -> Result<(), OsError> {
        run(&["route", "add", "default", "via", &gateway.to_string()]).await
    }

    async fn set_hostname(&self, hostname: &str) -> Result<(), OsError> {
        run_other("hostname", &[hostname]).await
    }
}

async fn run(args: &[&str]) -> Result<(), OsError> {
    run_other("ip", args).await
}

async fn run_other(program: &str, args: &[&str]) -> Result<(), OsError> {
    let command = format!("{program} {}", args.join(" "));
    debug!(%command, "running network command");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| OsError::Io {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(OsError::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}
