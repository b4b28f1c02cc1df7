//! Root-filesystem provider — given a URL, materializes a rootfs path
//! with environment and declared volumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use url::Url;

use crate::fetcher::{Fetcher, FetcherError};
use crate::graph::{GraphDriver, GraphError};

#[derive(Error, Debug)]
pub enum RootfsError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("layer fetch error: {0}")]
    Fetcher(#[from] FetcherError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("docker rootfs url must have a non-empty path")]
    InvalidDockerUrl,

    #[error("unsupported rootfs url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("no such container: {0}")]
    NoSuchContainer(String),
}

pub struct ProvideResult {
    pub path: PathBuf,
    pub env: Vec<(String, String)>,
}

pub struct RootfsManager {
    overlay_root: PathBuf,
    fetcher: Arc<Fetcher>,
    graph: Arc<dyn GraphDriver>,
    active: Mutex<HashMap<String, String>>,
}

impl RootfsManager {
    pub fn new(overlay_root: PathBuf, fetcher: Arc<Fetcher>, graph: Arc<dyn GraphDriver>) -> Self {
        Self {
            overlay_root,
            fetcher,
            graph,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn provide(&self, id: &str, url: &Url) -> Result<ProvideResult, RootfsError> {
        match url.scheme() {
            "" | "local" => self.provide_overlay(id).await,
            "docker" => self.provide_docker(id, url).await,
            other => Err(RootfsError::UnsupportedScheme(other.to_string())),
        }
    }

    async fn provide_overlay(&self, id: &str) -> Result<ProvideResult, RootfsError> {
        let path = self.overlay_root.join(id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(ProvideResult { path, env: Vec::new() })
    }

    async fn provide_docker(&self, id: &str, url: &Url) -> Result<ProvideResult, RootfsError> {
        if url.path().is_empty() || url.path() == "/" {
            return Err(RootfsError::InvalidDockerUrl);
        }

        let repository = url.path().trim_start_matches('/').to_string();
        let tag = url.fragment().unwrap_or("latest").to_string();

        let fetched = self.fetcher.fetch(&repository, &tag).await?;

        self.graph.create(id, &fetched.image_id).await?;
        let path = self.graph.get_path(id).await?;

        for volume in &fetched.volumes {
            let mount_point = path.join(volume.trim_start_matches('/'));
            tokio::fs::create_dir_all(&mount_point).await?;
        }

        self.active.lock().insert(id.to_string(), fetched.image_id.clone());

        Ok(ProvideResult {
            path,
            env: fetched.env,
        })
    }

    /// Unmounts and removes `id`'s rootfs. Removes the active-rootfs
    /// entry regardless of whether deletion ultimately succeeded.
    pub async fn cleanup(&self, id: &str) -> Result<(), RootfsError> {
        let _ = self.graph.put(id).await;

        let mut last_err = None;
        for _ in 0..10 {
            match self.graph.delete(id).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(err) => {
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }

        self.active.lock().remove(id);

        match last_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Docker-variant only: diffs the container's writable layer and
    /// hands it to the fetcher's commit-and-export path.
    pub async fn commit_and_save(&self, id: &str, dest: &Path) -> Result<(), RootfsError> {
        let parent_image_id = self
            .active
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| RootfsError::NoSuchContainer(id.to_string()))?;

        let diff_dir = tempfile::tempdir()?;
        let diff_path = diff_dir.path().join("diff.tar");
        self.graph.diff(id, &diff_path).await?;
        let diff_bytes = tokio::fs::read(&diff_path).await?;

        self.fetcher
            .commit_and_export(id, &parent_image_id, dest, &diff_bytes)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::local::LocalGraph;
    use crate::registry::{HistoryEntry, RegistryClient, RegistryError, RegistryProvider, RepositoryData};
    use async_trait::async_trait;
    use serde_json::json;

    struct FakeClient;

    #[async_trait]
    impl RegistryClient for FakeClient {
        async fn get_repository_data(&self, _repository: &str) -> Result<RepositoryData, RegistryError> {
            let mut tags = HashMap::new();
            tags.insert("latest".to_string(), "img".to_string());
            Ok(RepositoryData {
                endpoints: vec!["https://fake".to_string()],
                tags,
            })
        }

        async fn get_remote_tags(&self, _e: &str, _r: &str) -> Result<HashMap<String, String>, RegistryError> {
            Ok(HashMap::new())
        }

        async fn get_remote_history(&self, _e: &str, image_id: &str) -> Result<Vec<HistoryEntry>, RegistryError> {
            Ok(vec![HistoryEntry { layer_id: image_id.to_string() }])
        }

        async fn get_remote_image_json(&self, _e: &str, _image_id: &str) -> Result<serde_json::Value, RegistryError> {
            Ok(json!({"config": {"Env": ["A=1"], "Volumes": {"/data": {}}}}))
        }

        async fn get_remote_image_layer(&self, _e: &str, _image_id: &str) -> Result<Vec<u8>, RegistryError> {
            Ok(b"layer-bytes".to_vec())
        }
    }

    struct FakeProvider;

    #[async_trait]
    impl RegistryProvider for FakeProvider {
        async fn provide_registry(&self, _hostname: &str) -> Result<Arc<dyn RegistryClient>, RegistryError> {
            Ok(Arc::new(FakeClient))
        }

        fn apply_default_hostname(&self, repository_name: &str) -> (String, String) {
            ("fake".to_string(), repository_name.to_string())
        }
    }

    fn manager() -> (RootfsManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let graph: Arc<dyn GraphDriver> = Arc::new(LocalGraph::new(dir.path().join("graph")));
        let fetcher = Arc::new(Fetcher::new(Arc::new(FakeProvider), graph.clone()));
        (
            RootfsManager::new(dir.path().join("overlay"), fetcher, graph),
            dir,
        )
    }

    #[tokio::test]
    async fn overlay_url_provides_empty_env_and_no_graph_entry() {
        let (mgr, _dir) = manager();
        let url: Url = "local://".parse().unwrap();

        let result = mgr.provide("c1", &url).await.unwrap();
        assert!(result.env.is_empty());
        assert!(result.path.exists());
    }

    #[tokio::test]
    async fn docker_url_requires_non_empty_path() {
        let (mgr, _dir) = manager();
        let url: Url = "docker://host".parse().unwrap();
        assert!(matches!(
            mgr.provide("c1", &url).await,
            Err(RootfsError::InvalidDockerUrl)
        ));
    }

    #[tokio::test]
    async fn docker_url_fetches_and_records_active_entry() {
        let (mgr, _dir) = manager();
        let url: Url = "docker:///library/app".parse().unwrap();

        let result = mgr.provide("c1", &url).await.unwrap();
        assert_eq!(result.env, vec![("A".to_string(), "1".to_string())]);
        assert!(mgr.active.lock().contains_key("c1"));
    }

    #[tokio::test]
    async fn cleanup_removes_active_entry_even_after_graph_delete() {
        let (mgr, _dir) = manager();
        let url: Url = "docker:///library/app".parse().unwrap();
        mgr.provide("c1", &url).await.unwrap();

        mgr.cleanup("c1").await.unwrap();
        assert!(!mgr.active.lock().contains_key("c1"));
    }

    #[tokio::test]
    async fn commit_and_save_without_active_entry_is_no_such_container() {
        let (mgr, dir) = manager();
        let dest = dir.path().join("out.tar");
        let err = mgr.commit_and_save("missing", &dest).await.unwrap_err();
        assert!(matches!(err, RootfsError::NoSuchContainer(_)));
    }
}
