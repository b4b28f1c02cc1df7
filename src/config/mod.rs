//! Configuration management module
//!
//! TOML-based daemon configuration, following the same load/resolve
//! pattern as a Wings-style container daemon.

mod config;

pub use config::*;
