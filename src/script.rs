//! Helper-script runner and the canonical environment contract. Every
//! privileged operation goes through a fixed `setup.sh` / `create.sh` /
//! `destroy.sh` trio in the configured `bin_path`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub const CANONICAL_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("script {script} exited with status {status}")]
    NonZeroExit { script: String, status: i32 },

    #[error("io error running {script}: {source}")]
    Io {
        script: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct ScriptRunner {
    bin_path: PathBuf,
}

pub struct SetupEnv {
    pub pool_network: String,
    pub allow_networks: String,
    pub deny_networks: String,
    pub container_rootfs_path: PathBuf,
    pub container_depot_path: PathBuf,
    pub container_depot_mount_point_path: PathBuf,
    pub disk_quota_enabled: bool,
}

pub struct CreateEnv {
    pub id: String,
    pub rootfs_path: PathBuf,
    pub allow_nested_warden: bool,
    pub container_iface_mtu: u32,
}

impl ScriptRunner {
    pub fn new(bin_path: PathBuf) -> Self {
        Self { bin_path }
    }

    pub async fn setup(&self, env: &SetupEnv) -> Result<(), ScriptError> {
        self.run(
            "setup.sh",
            &[],
            &[
                ("POOL_NETWORK", env.pool_network.clone()),
                ("ALLOW_NETWORKS", env.allow_networks.clone()),
                ("DENY_NETWORKS", env.deny_networks.clone()),
                (
                    "CONTAINER_ROOTFS_PATH",
                    env.container_rootfs_path.display().to_string(),
                ),
                (
                    "CONTAINER_DEPOT_PATH",
                    env.container_depot_path.display().to_string(),
                ),
                (
                    "CONTAINER_DEPOT_MOUNT_POINT_PATH",
                    env.container_depot_mount_point_path.display().to_string(),
                ),
                (
                    "DISK_QUOTA_ENABLED",
                    bool_str(env.disk_quota_enabled).to_string(),
                ),
            ],
        )
        .await
    }

    pub async fn create(&self, depot_container_path: &Path, env: &CreateEnv) -> Result<(), ScriptError> {
        self.run(
            "create.sh",
            &[depot_container_path.display().to_string()],
            &[
                ("id", env.id.clone()),
                ("rootfs_path", env.rootfs_path.display().to_string()),
                (
                    "allow_nested_warden",
                    bool_str(env.allow_nested_warden).to_string(),
                ),
                (
                    "container_iface_mtu",
                    env.container_iface_mtu.to_string(),
                ),
            ],
        )
        .await
    }

    pub async fn destroy(&self, depot_container_path: &Path, id: &str) -> Result<(), ScriptError> {
        self.run(
            "destroy.sh",
            &[depot_container_path.display().to_string()],
            &[("id", id.to_string())],
        )
        .await
    }

    async fn run(
        &self,
        script: &str,
        args: &[String],
        vars: &[(&str, String)],
    ) -> Result<(), ScriptError> {
        let path = self.bin_path.join(script);
        debug!(script, ?args, "running helper script");

        let mut command = Command::new(&path);
        command.args(args);
        command.env_clear();
        command.env("PATH", CANONICAL_PATH);
        for (key, value) in vars {
            command.env(key, value);
        }

        let status = command.status().await.map_err(|source| ScriptError::Io {
            script: script.to_string(),
            source,
        })?;

        if !status.success() {
            warn!(script, code = status.code(), "helper script failed");
            return Err(ScriptError::NonZeroExit {
                script: script.to_string(),
                status: status.code().unwrap_or(-1),
            });
        }

        Ok(())
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_path_matches_the_documented_contract() {
        assert_eq!(
            CANONICAL_PATH,
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
        );
    }

    #[test]
    fn bool_str_matches_shell_convention() {
        assert_eq!(bool_str(true), "true");
        assert_eq!(bool_str(false), "false");
    }

    #[tokio::test]
    async fn setup_surfaces_non_zero_exit_as_script_failed() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("setup.sh");
        tokio::fs::write(&script_path, "#!/bin/sh\nexit 1\n").await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&script_path).await.unwrap().permissions();
            perms.set_mode(0o755);
            tokio::fs::set_permissions(&script_path, perms).await.unwrap();
        }

        let runner = ScriptRunner::new(dir.path().to_path_buf());
        let env = SetupEnv {
            pool_network: "10.254.0.0/24".into(),
            allow_networks: String::new(),
            deny_networks: String::new(),
            container_rootfs_path: "/rootfs/path".into(),
            container_depot_path: "/depot/path".into(),
            container_depot_mount_point_path: "/".into(),
            disk_quota_enabled: true,
        };

        let err = runner.setup(&env).await.unwrap_err();
        assert!(matches!(err, ScriptError::NonZeroExit { status: 1, .. }));
    }
}
