//! Data model shared across the crate.

pub mod container;
pub mod image;
pub mod network;

pub use container::{
    Container, ContainerSpec, ContainerState, Limits, NetInRule, NetOutRule, ResourcesBundle,
};
pub use image::ImageRef;
pub use network::NetworkResources;
