//! The container entity.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use super::image::ImageRef;
use super::network::NetworkResources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Creating,
    Active,
    Stopped,
    Destroying,
    Destroyed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetInRule {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetOutRule {
    pub network: Ipv4Network,
    pub port_range: Option<(u16, u16)>,
    pub protocol: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
    pub bandwidth_bytes_per_sec: Option<u64>,
    pub cpu_shares: Option<u32>,
}

/// What a client requests when creating a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub rootfs: Option<ImageRef>,
    pub static_subnet: Option<(Ipv4Network, Ipv4Addr)>,
    pub requested_ports: Vec<u16>,
    pub env: Vec<(String, String)>,
    pub grace_time_secs: Option<u64>,
    pub limits: Limits,
}

/// The resources bundle owned one-to-one by a container.
#[derive(Debug, Clone)]
pub struct ResourcesBundle {
    pub uid: u32,
    pub network: NetworkResources,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct Container {
    pub handle: String,
    pub id: String,
    pub state: ContainerState,
    pub grace_time_secs: u64,
    pub resources: ResourcesBundle,
    pub net_in: HashMap<u16, u16>,
    pub net_out: Vec<NetOutRule>,
    pub limits: Limits,
    pub created_at: DateTime<Utc>,
}

impl Container {
    pub fn is_terminal(&self) -> bool {
        self.state == ContainerState::Destroyed
    }
}
