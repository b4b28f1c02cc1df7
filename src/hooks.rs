//! Hook runner — an ordered registry of callbacks per lifecycle point.

use std::collections::HashMap;
use std::os::unix::fs::symlink;
use std::path::Path;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum HookError {
    #[error("hook at {point:?} failed: {source}")]
    Failed {
        point: HookPoint,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl HookError {
    pub fn at(point: HookPoint, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        HookError::Failed {
            point,
            source: Box::new(source),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    ParentBeforeClone,
    ParentAfterClone,
    ChildBeforePivot,
    ChildAfterPivot,
}

/// Context handed to every registered hook. Hooks close over whatever
/// collaborators they need (network configurator, script runner, ...);
/// this just carries the identifying/pathing information common to all
/// of them.
pub struct HookContext {
    pub container_id: String,
    pub container_pid: u32,
    pub container_root: std::path::PathBuf,
}

pub type HookFn =
    Box<dyn for<'a> Fn(&'a HookContext) -> BoxFuture<'a, Result<(), HookError>> + Send + Sync>;

#[derive(Default)]
pub struct HookSet {
    hooks: HashMap<HookPoint, Vec<HookFn>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` at `point`. Cumulative: callbacks run in
    /// registration order.
    pub fn register(&mut self, point: HookPoint, hook: HookFn) {
        self.hooks.entry(point).or_default().push(hook);
    }

    /// Run every hook registered at `point`, in order. Any failure is
    /// fatal to the current lifecycle and stops the sequence.
    pub async fn run(&self, point: HookPoint, ctx: &HookContext) -> Result<(), HookError> {
        debug!(?point, container_id = %ctx.container_id, "running hooks");
        if let Some(hooks) = self.hooks.get(&point) {
            for hook in hooks {
                hook(ctx).await?;
            }
        }
        Ok(())
    }
}

/// Mounts `/proc` and `/tmp` inside the container's mount namespace.
/// Idempotent: an already-mounted target is treated as success.
pub fn mount_proc_and_tmp(container_root: &Path) -> Result<(), std::io::Error> {
    use nix::mount::{mount, MsFlags};

    let proc_target = container_root.join("proc");
    let tmp_target = container_root.join("tmp");

    std::fs::create_dir_all(&proc_target)?;
    std::fs::create_dir_all(&tmp_target)?;

    if let Err(err) = mount(
        Some("proc"),
        &proc_target,
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    ) {
        if err != nix::errno::Errno::EBUSY {
            return Err(std::io::Error::from(err));
        }
    }

    if let Err(err) = mount(
        Some("tmpfs"),
        &tmp_target,
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    ) {
        if err != nix::errno::Errno::EBUSY {
            return Err(std::io::Error::from(err));
        }
    }

    Ok(())
}

/// Executes `/etc/seed` via a shell if present, capturing combined
/// output for failure reporting. A no-op if the file does not exist.
pub async fn run_seed_script(container_root: &Path) -> Result<(), std::io::Error> {
    let seed = container_root.join("etc/seed");
    if !seed.exists() {
        return Ok(());
    }

    let output = tokio::process::Command::new("/bin/sh")
        .arg(&seed)
        .output()
        .await?;

    if !output.status.success() {
        warn!(
            status = ?output.status.code(),
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "seed script failed"
        );
        return Err(std::io::Error::other(format!(
            "/etc/seed exited with {:?}",
            output.status.code()
        )));
    }

    Ok(())
}

/// Ensures `/etc/mtab` is a symlink to `/proc/mounts`, creating it only
/// when absent.
pub fn ensure_mtab_symlink(container_root: &Path) -> Result<(), std::io::Error> {
    let mtab = container_root.join("etc/mtab");
    if mtab.exists() || mtab.symlink_metadata().is_ok() {
        return Ok(());
    }
    symlink("/proc/mounts", &mtab)
}
