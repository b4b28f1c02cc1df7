//! Graph store interface — the content-addressed layer/image graph the
//! fetcher and rootfs provider build on.

pub mod local;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

pub use local::LocalGraph;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("image {0} not found")]
    NotFound(String),

    #[error("image {0} already registered")]
    AlreadyExists(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single layer or image node: its JSON metadata plus where its
/// filesystem content lives once registered.
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    pub id: String,
    pub parent: Option<String>,
    pub json: serde_json::Value,
}

/// Mount/unmount and registration vocabulary borrowed from the
/// original's `graphdriver.Driver`.
#[async_trait]
pub trait GraphDriver: Send + Sync {
    /// True if `id` is already registered.
    async fn exists(&self, id: &str) -> bool;

    /// Fetch metadata for a registered image.
    async fn get(&self, id: &str) -> Result<ImageMetadata, GraphError>;

    /// Register a new image layer with its JSON metadata and raw
    /// (uncompressed tar) layer content.
    async fn register(
        &self,
        id: &str,
        parent: Option<&str>,
        json: serde_json::Value,
        layer_data: &[u8],
    ) -> Result<(), GraphError>;

    /// Create a new writable layer `id` on top of `parent`'s content,
    /// without layer data of its own (used for commit images).
    async fn create(&self, id: &str, parent: &str) -> Result<(), GraphError>;

    /// Mount `id`'s content and return the path it is mounted at,
    /// incrementing a use refcount.
    async fn get_path(&self, id: &str) -> Result<PathBuf, GraphError>;

    /// Decrement the use refcount taken by `get_path`.
    async fn put(&self, id: &str) -> Result<(), GraphError>;

    /// Remove `id` from the graph entirely.
    async fn delete(&self, id: &str) -> Result<(), GraphError>;

    /// Compute the filesystem diff of `id` against its parent, writing
    /// an uncompressed tar to `dest`.
    async fn diff(&self, id: &str, dest: &std::path::Path) -> Result<(), GraphError>;
}
