//! Crate-level error type
//!
//! Wraps the per-module error enums (`pool::PoolError`, `SubnetError`,
//! `FetcherError`, `RootfsError`, `HookError`, `ScriptError`, ...) so
//! callers can propagate a single error type across module boundaries.

use thiserror::Error;

use crate::fetcher::FetcherError;
use crate::hooks::HookError;
use crate::network::bridge::BridgeError;
use crate::network::ConfiguratorError;
use crate::pool::PoolError;
use crate::pool::subnet::SubnetError;
use crate::rootfs::RootfsError;
use crate::script::ScriptError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("subnet error: {0}")]
    Subnet(#[from] SubnetError),

    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("network configurator error: {0}")]
    Configurator(#[from] ConfiguratorError),

    #[error("rootfs error: {0}")]
    Rootfs(#[from] RootfsError),

    #[error("layer fetch error: {0}")]
    Fetcher(#[from] FetcherError),

    #[error("hook error: {0}")]
    Hook(#[from] HookError),

    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    #[error("no such container: {0}")]
    NoSuchContainer(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
