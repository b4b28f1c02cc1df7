//! Daemon bootstrap — loads configuration, wires the container pool,
//! and runs `setup.sh` once before idling for external callers.
//!
//! The wire-protocol server that would expose `Create`/`Destroy` over
//! the network is out of scope; this only stands the core subsystem up
//! the way an external driver would embed it.

use std::sync::Arc;

use anyhow::{Context, Result};
use container_core::{ContainerPool, Configuration};
use tracing::info;

/// Runs `setup.sh` once and exits. Used by the `setup` subcommand.
pub async fn run_setup(config_path: &str) -> Result<()> {
    let config = Configuration::load(config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;
    let pool = ContainerPool::from_config(Arc::new(config));
    pool.setup().await.context("setup.sh failed")?;
    info!("setup complete");
    Ok(())
}

/// Runs the daemon: loads configuration, runs `setup.sh`, then blocks
/// until interrupted.
pub async fn run(config_path: &str) -> Result<()> {
    info!("loading configuration from {config_path}");
    let config = Configuration::load(config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;
    let config = Arc::new(config);

    let pool = Arc::new(ContainerPool::from_config(config));
    pool.setup().await.context("setup.sh failed")?;
    info!("container pool ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to install ctrl-c handler")?;
    info!("shutting down");
    Ok(())
}
