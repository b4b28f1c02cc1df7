//! Per-container network resources bundle.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkResources {
    pub bridge_name: String,
    pub subnet: Ipv4Network,
    pub container_ip: Ipv4Addr,
    pub host_ip: Ipv4Addr,
}
