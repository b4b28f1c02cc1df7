//! In-memory/tempdir-backed [`GraphDriver`] — sufficient for tests and
//! for the local/overlay rootfs provider's bookkeeping. Layer content
//! is kept as opaque bytes rather than materializing a real overlay
//! filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;

use super::{GraphDriver, GraphError, ImageMetadata};

struct Node {
    parent: Option<String>,
    json: serde_json::Value,
    content: Vec<u8>,
    refcount: u32,
}

pub struct LocalGraph {
    base_dir: PathBuf,
    nodes: Mutex<HashMap<String, Node>>,
}

impl LocalGraph {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn dir_for(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }
}

#[async_trait]
impl GraphDriver for LocalGraph {
    async fn exists(&self, id: &str) -> bool {
        self.nodes.lock().contains_key(id)
    }

    async fn get(&self, id: &str) -> Result<ImageMetadata, GraphError> {
        let nodes = self.nodes.lock();
        let node = nodes.get(id).ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        Ok(ImageMetadata {
            id: id.to_string(),
            parent: node.parent.clone(),
            json: node.json.clone(),
        })
    }

    async fn register(
        &self,
        id: &str,
        parent: Option<&str>,
        json: serde_json::Value,
        layer_data: &[u8],
    ) -> Result<(), GraphError> {
        {
            let mut nodes = self.nodes.lock();
            if nodes.contains_key(id) {
                return Err(GraphError::AlreadyExists(id.to_string()));
            }
            nodes.insert(
                id.to_string(),
                Node {
                    parent: parent.map(str::to_string),
                    json,
                    content: layer_data.to_vec(),
                    refcount: 0,
                },
            );
        }

        let dir = self.dir_for(id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join("layer.tar"), layer_data).await?;
        Ok(())
    }

    async fn create(&self, id: &str, parent: &str) -> Result<(), GraphError> {
        let parent_json = self.get(parent).await?.json;

        let mut nodes = self.nodes.lock();
        if nodes.contains_key(id) {
            return Err(GraphError::AlreadyExists(id.to_string()));
        }
        nodes.insert(
            id.to_string(),
            Node {
                parent: Some(parent.to_string()),
                json: parent_json,
                content: Vec::new(),
                refcount: 0,
            },
        );
        Ok(())
    }

    async fn get_path(&self, id: &str) -> Result<PathBuf, GraphError> {
        let dir = {
            let mut nodes = self.nodes.lock();
            let node = nodes
                .get_mut(id)
                .ok_or_else(|| GraphError::NotFound(id.to_string()))?;
            node.refcount += 1;
            self.dir_for(id)
        };
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn put(&self, id: &str) -> Result<(), GraphError> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        node.refcount = node.refcount.saturating_sub(1);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), GraphError> {
        {
            let mut nodes = self.nodes.lock();
            nodes
                .remove(id)
                .ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        }
        let dir = self.dir_for(id);
        if dir.exists() {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    async fn diff(&self, id: &str, dest: &Path) -> Result<(), GraphError> {
        let content = {
            let nodes = self.nodes.lock();
            nodes
                .get(id)
                .ok_or_else(|| GraphError::NotFound(id.to_string()))?
                .content
                .clone()
        };
        fs::write(dest, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_then_get_round_trips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let graph = LocalGraph::new(dir.path().to_path_buf());

        graph
            .register("sha:a", None, json!({"Id": "a"}), b"layer-a")
            .await
            .unwrap();

        assert!(graph.exists("sha:a").await);
        let meta = graph.get("sha:a").await.unwrap();
        assert_eq!(meta.parent, None);
        assert_eq!(meta.json["Id"], "a");
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let graph = LocalGraph::new(dir.path().to_path_buf());

        graph.register("sha:a", None, json!({}), b"x").await.unwrap();
        assert!(matches!(
            graph.register("sha:a", None, json!({}), b"x").await,
            Err(GraphError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn create_inherits_parent_json() {
        let dir = tempfile::tempdir().unwrap();
        let graph = LocalGraph::new(dir.path().to_path_buf());

        graph
            .register("sha:parent", None, json!({"Env": ["A=1"]}), b"p")
            .await
            .unwrap();
        graph.create("sha:child", "sha:parent").await.unwrap();

        let meta = graph.get("sha:child").await.unwrap();
        assert_eq!(meta.parent.as_deref(), Some("sha:parent"));
        assert_eq!(meta.json["Env"][0], "A=1");
    }

    #[tokio::test]
    async fn delete_removes_registration_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let graph = LocalGraph::new(dir.path().to_path_buf());

        graph.register("sha:a", None, json!({}), b"x").await.unwrap();
        graph.delete("sha:a").await.unwrap();

        assert!(!graph.exists("sha:a").await);
        assert!(matches!(graph.get("sha:a").await, Err(GraphError::NotFound(_))));
    }

    #[tokio::test]
    async fn diff_writes_registered_layer_content() {
        let dir = tempfile::tempdir().unwrap();
        let graph = LocalGraph::new(dir.path().to_path_buf());

        graph.register("sha:a", None, json!({}), b"layer-bytes").await.unwrap();

        let out = dir.path().join("out.tar");
        graph.diff("sha:a", &out).await.unwrap();
        assert_eq!(fs::read(&out).await.unwrap(), b"layer-bytes");
    }
}
