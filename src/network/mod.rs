//! Bridge management and host/container network configuration.

pub mod bridge;
pub mod configurator;
pub mod os;

pub use bridge::{BridgeError, BridgeManager};
pub use configurator::{ConfiguratorError, ContainerConfig, HostConfig, NetworkConfigurator};
pub use os::{IpRoute2, NetOs, OsError};
