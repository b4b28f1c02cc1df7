//! Layer fetcher — cache-aware, single-flight registry downloader.
//! Concurrent requests for the same layer digest join the in-flight
//! download instead of re-fetching it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::graph::{GraphDriver, GraphError};
use crate::registry::{RegistryClient, RegistryError, RegistryProvider};

#[derive(Error, Debug)]
pub enum FetcherError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("tag {tag} not found in repository {repository}")]
    TagNotFound { repository: String, tag: String },

    #[error("no registry endpoints returned for repository")]
    NoEndpoints,

    #[error("commit destination must end in .tar: {0}")]
    BadSuffix(PathBuf),

    #[error("commit destination is a directory: {0}")]
    DestinationIsDirectory(PathBuf),
}

/// Result of resolving a repository:tag into a fully-fetched image plus
/// its aggregated environment and declared volumes.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub image_id: String,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<String>,
}

pub struct Fetcher {
    provider: Arc<dyn RegistryProvider>,
    graph: Arc<dyn GraphDriver>,
    fetching: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl Fetcher {
    pub fn new(provider: Arc<dyn RegistryProvider>, graph: Arc<dyn GraphDriver>) -> Self {
        Self {
            provider,
            graph,
            fetching: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self), fields(repository = %repository_name, tag))]
    pub async fn fetch(
        &self,
        repository_name: &str,
        tag: &str,
    ) -> Result<FetchResult, FetcherError> {
        let (hostname, repository) = self.provider.apply_default_hostname(repository_name);
        let client = self.provider.provide_registry(&hostname).await?;
        let repo_data = client.get_repository_data(&repository).await?;

        let image_id = repo_data
            .tags
            .get(tag)
            .cloned()
            .ok_or_else(|| FetcherError::TagNotFound {
                repository: repository.clone(),
                tag: tag.to_string(),
            })?;

        if repo_data.endpoints.is_empty() {
            return Err(FetcherError::NoEndpoints);
        }

        let mut last_err = None;
        for endpoint in &repo_data.endpoints {
            match self
                .fetch_from_endpoint(client.as_ref(), endpoint, &image_id)
                .await
            {
                Ok((env, volumes)) => {
                    return Ok(FetchResult {
                        image_id,
                        env,
                        volumes,
                    })
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.expect("endpoints non-empty implies at least one attempt"))
    }

    async fn fetch_from_endpoint(
        &self,
        client: &dyn RegistryClient,
        endpoint: &str,
        image_id: &str,
    ) -> Result<(Vec<(String, String)>, Vec<String>), FetcherError> {
        let history = client.get_remote_history(endpoint, image_id).await?;

        let mut env: Vec<(String, String)> = Vec::new();
        let mut volumes: Vec<String> = Vec::new();

        // Parent-first: history is child-to-parent, so walk it in reverse.
        for entry in history.iter().rev() {
            let json = self.fetch_layer(client, endpoint, &entry.layer_id).await?;
            merge_env(&mut env, extract_env(&json));
            merge_volumes(&mut volumes, extract_volumes(&json));
        }

        Ok((env, volumes))
    }

    async fn fetch_layer(
        &self,
        client: &dyn RegistryClient,
        endpoint: &str,
        layer_id: &str,
    ) -> Result<serde_json::Value, FetcherError> {
        loop {
            if self.graph.exists(layer_id).await {
                return Ok(self.graph.get(layer_id).await?.json);
            }

            let waiter = {
                let mut table = self.fetching.lock();
                match table.get(layer_id) {
                    Some(tx) => Some(tx.subscribe()),
                    None => {
                        let (tx, _rx) = broadcast::channel(1);
                        table.insert(layer_id.to_string(), tx);
                        None
                    }
                }
            };

            match waiter {
                Some(mut rx) => {
                    // Wait for the owner to finish, then re-enter the gate.
                    let _ = rx.recv().await;
                    continue;
                }
                None => {
                    let result = self.download_layer(client, endpoint, layer_id).await;
                    self.done_fetching(layer_id);
                    return result;
                }
            }
        }
    }

    async fn download_layer(
        &self,
        client: &dyn RegistryClient,
        endpoint: &str,
        layer_id: &str,
    ) -> Result<serde_json::Value, FetcherError> {
        let started = std::time::Instant::now();
        info!(layer_id, "downloading layer");

        let layer_json = client.get_remote_image_json(endpoint, layer_id).await?;
        let layer_data = client.get_remote_image_layer(endpoint, layer_id).await?;

        let parent = layer_json
            .get("parent")
            .or_else(|| layer_json.get("Parent"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        self.graph
            .register(layer_id, parent.as_deref(), layer_json.clone(), &layer_data)
            .await?;

        info!(layer_id, elapsed_ms = started.elapsed().as_millis() as u64, "downloaded layer");
        Ok(layer_json)
    }

    fn done_fetching(&self, layer_id: &str) {
        if let Some(tx) = self.fetching.lock().remove(layer_id) {
            let _ = tx.send(());
        }
    }

    /// Commit a container's writable layer diff and export the full
    /// image chain into an uncompressed tarball at `dest`.
    #[instrument(skip(self, diff_layer), fields(container_id, parent_image_id))]
    pub async fn commit_and_export(
        &self,
        container_id: &str,
        parent_image_id: &str,
        dest: &Path,
        diff_layer: &[u8],
    ) -> Result<(), FetcherError> {
        if dest.extension().and_then(|e| e.to_str()) != Some("tar") {
            return Err(FetcherError::BadSuffix(dest.to_path_buf()));
        }
        if dest.is_dir() {
            return Err(FetcherError::DestinationIsDirectory(dest.to_path_buf()));
        }
        if dest.exists() {
            tokio::fs::remove_file(dest).await?;
        }

        let commit_id = Uuid::new_v4().to_string();
        let parent_meta = self.graph.get(parent_image_id).await?;

        let mut commit_json = parent_meta.json.clone();
        if let Some(obj) = commit_json.as_object_mut() {
            obj.insert("Parent".to_string(), json!(parent_image_id));
            obj.insert("Container".to_string(), json!(container_id));
        }

        self.graph
            .register(&commit_id, Some(parent_image_id), commit_json, diff_layer)
            .await?;

        let work_dir = tempfile::tempdir()?;
        let export_result = self.export_chain(&commit_id, work_dir.path()).await;
        let tar_result = match &export_result {
            Ok(()) => self.tar_directory(work_dir.path(), dest).await,
            Err(_) => Ok(()),
        };

        self.delete_with_retry(&commit_id).await?;

        export_result?;
        tar_result?;
        Ok(())
    }

    async fn export_chain(&self, id: &str, work_dir: &Path) -> Result<(), FetcherError> {
        let mut current = Some(id.to_string());
        while let Some(cur_id) = current {
            let meta = self.graph.get(&cur_id).await?;
            let node_dir = work_dir.join(&cur_id);
            tokio::fs::create_dir_all(&node_dir).await?;
            tokio::fs::write(node_dir.join("VERSION"), "1.0").await?;
            tokio::fs::write(node_dir.join("json"), serde_json::to_vec(&meta.json)?).await?;
            self.graph.diff(&cur_id, &node_dir.join("layer.tar")).await?;
            current = meta.parent;
        }
        Ok(())
    }

    async fn tar_directory(&self, src: &Path, dest: &Path) -> Result<(), FetcherError> {
        let src = src.to_path_buf();
        let dest = dest.to_path_buf();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = std::fs::File::create(&dest)?;
            let mut builder = tar::Builder::new(file);
            builder.append_dir_all(".", &src)?;
            builder.finish()
        })
        .await??;

        Ok(())
    }

    async fn delete_with_retry(&self, id: &str) -> Result<(), FetcherError> {
        let mut last_err: Option<GraphError> = None;
        for _ in 0..10 {
            match self.graph.delete(id).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
        Err(last_err.expect("loop runs at least once").into())
    }
}

/// Skip malformed entries (no `=`); later entries overwrite earlier
/// ones with the same key, matching the original's `filterEnv`.
fn merge_env(into: &mut Vec<(String, String)>, incoming: Vec<(String, String)>) {
    for (key, value) in incoming {
        if let Some(slot) = into.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            into.push((key, value));
        }
    }
}

/// First declaration wins; position of first appearance is preserved.
fn merge_volumes(into: &mut Vec<String>, incoming: Vec<String>) {
    for path in incoming {
        if !into.contains(&path) {
            into.push(path);
        }
    }
}

fn extract_env(json: &serde_json::Value) -> Vec<(String, String)> {
    let raw = json
        .get("config")
        .or_else(|| json.get("Config"))
        .and_then(|c| c.get("Env").or_else(|| c.get("env")))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    raw.into_iter()
        .filter_map(|entry| entry.as_str().map(str::to_string))
        .filter_map(|entry| entry.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

fn extract_volumes(json: &serde_json::Value) -> Vec<String> {
    json.get("config")
        .or_else(|| json.get("Config"))
        .and_then(|c| c.get("Volumes").or_else(|| c.get("volumes")))
        .and_then(|v| v.as_object())
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::local::LocalGraph;
    use crate::registry::{HistoryEntry, RepositoryData};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeClient {
        layer_fetch_count: AtomicUsize,
        layers: HashMap<String, serde_json::Value>,
        tags: HashMap<String, String>,
    }

    #[async_trait]
    impl RegistryClient for FakeClient {
        async fn get_repository_data(&self, _repository: &str) -> Result<RepositoryData, RegistryError> {
            Ok(RepositoryData {
                endpoints: vec!["https://fake".to_string()],
                tags: self.tags.clone(),
            })
        }

        async fn get_remote_tags(
            &self,
            _endpoint: &str,
            _repository: &str,
        ) -> Result<HashMap<String, String>, RegistryError> {
            Ok(self.tags.clone())
        }

        async fn get_remote_history(
            &self,
            _endpoint: &str,
            image_id: &str,
        ) -> Result<Vec<HistoryEntry>, RegistryError> {
            // "child" is the leaf, whose parent is "base".
            if image_id == "child" {
                Ok(vec![
                    HistoryEntry { layer_id: "child".to_string() },
                    HistoryEntry { layer_id: "base".to_string() },
                ])
            } else {
                Ok(vec![HistoryEntry { layer_id: image_id.to_string() }])
            }
        }

        async fn get_remote_image_json(
            &self,
            _endpoint: &str,
            image_id: &str,
        ) -> Result<serde_json::Value, RegistryError> {
            Ok(self.layers.get(image_id).cloned().unwrap_or(json!({})))
        }

        async fn get_remote_image_layer(
            &self,
            _endpoint: &str,
            image_id: &str,
        ) -> Result<Vec<u8>, RegistryError> {
            self.layer_fetch_count.fetch_add(1, Ordering::SeqCst);
            Ok(format!("layer-data-{image_id}").into_bytes())
        }
    }

    struct FakeProvider {
        client: Arc<FakeClient>,
    }

    #[async_trait]
    impl RegistryProvider for FakeProvider {
        async fn provide_registry(
            &self,
            _hostname: &str,
        ) -> Result<Arc<dyn RegistryClient>, RegistryError> {
            Ok(self.client.clone())
        }

        fn apply_default_hostname(&self, repository_name: &str) -> (String, String) {
            ("fake.registry".to_string(), repository_name.to_string())
        }
    }

    fn layered_fixture() -> (Arc<FakeProvider>, Arc<LocalGraph>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let graph = Arc::new(LocalGraph::new(dir.path().to_path_buf()));

        let mut tags = HashMap::new();
        tags.insert("latest".to_string(), "child".to_string());

        let mut layers = HashMap::new();
        layers.insert(
            "base".to_string(),
            json!({"config": {"Env": ["A=1", "B=2"], "Volumes": {"/data": {}}}}),
        );
        layers.insert(
            "child".to_string(),
            json!({"config": {"Env": ["B=override", "malformed-no-equals"], "Volumes": {"/cache": {}}}}),
        );

        let client = Arc::new(FakeClient {
            layer_fetch_count: AtomicUsize::new(0),
            layers,
            tags,
        });

        (Arc::new(FakeProvider { client }), graph, dir)
    }

    #[tokio::test]
    async fn fetch_merges_env_parent_first_with_child_overriding() {
        let (provider, graph, _dir) = layered_fixture();
        let fetcher = Fetcher::new(provider, graph);

        let result = fetcher.fetch("anything", "latest").await.unwrap();

        assert_eq!(result.image_id, "child");
        assert!(result.env.contains(&("A".to_string(), "1".to_string())));
        assert!(result.env.contains(&("B".to_string(), "override".to_string())));
        assert!(!result.env.iter().any(|(k, _)| k == "malformed-no-equals"));
    }

    #[tokio::test]
    async fn fetch_keeps_first_declared_volume_position() {
        let (provider, graph, _dir) = layered_fixture();
        let fetcher = Fetcher::new(provider, graph);

        let result = fetcher.fetch("anything", "latest").await.unwrap();

        assert_eq!(result.volumes, vec!["/data".to_string(), "/cache".to_string()]);
    }

    #[tokio::test]
    async fn unknown_tag_is_an_error() {
        let (provider, graph, _dir) = layered_fixture();
        let fetcher = Fetcher::new(provider, graph);

        let err = fetcher.fetch("anything", "missing-tag").await.unwrap_err();
        assert!(matches!(err, FetcherError::TagNotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_fetches_of_same_layer_download_exactly_once() {
        let (provider, graph, _dir) = layered_fixture();
        let fetcher = Arc::new(Fetcher::new(provider.clone(), graph));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fetcher = fetcher.clone();
                tokio::spawn(async move { fetcher.fetch("anything", "latest").await })
            })
            .collect();

        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(provider.client.layer_fetch_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn commit_and_export_rejects_non_tar_destination() {
        let dir = tempfile::tempdir().unwrap();
        let graph = Arc::new(LocalGraph::new(dir.path().to_path_buf()));
        let (provider, _, _d) = layered_fixture();
        let fetcher = Fetcher::new(provider, graph.clone());

        graph.register("parent", None, json!({}), b"p").await.unwrap();

        let bad_dest = dir.path().join("out.zip");
        let err = fetcher
            .commit_and_export("container-1", "parent", &bad_dest, b"diff")
            .await
            .unwrap_err();
        assert!(matches!(err, FetcherError::BadSuffix(_)));
    }

    #[tokio::test]
    async fn commit_and_export_produces_a_tar_and_forgets_the_commit_image() {
        let dir = tempfile::tempdir().unwrap();
        let graph = Arc::new(LocalGraph::new(dir.path().to_path_buf()));
        let (provider, _, _d) = layered_fixture();
        let fetcher = Fetcher::new(provider, graph.clone());

        graph
            .register("parent", None, json!({"Comment": "base image"}), b"parent-data")
            .await
            .unwrap();

        let dest = dir.path().join("export.tar");
        fetcher
            .commit_and_export("container-1", "parent", &dest, b"diff-bytes")
            .await
            .unwrap();

        assert!(dest.exists());
        assert!(graph.exists("parent").await, "parent image must survive the commit");
    }
}
