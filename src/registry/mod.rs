//! Registry client interface — fetches manifests and layer blobs from
//! a container image registry.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpRegistryClient;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response from {endpoint}: {status}")]
    UnexpectedStatus {
        endpoint: String,
        status: reqwest::StatusCode,
    },

    #[error("tag {tag} not found in repository {repository}")]
    TagNotFound { repository: String, tag: String },

    #[error("malformed registry response: {0}")]
    MalformedResponse(String),
}

/// One endpoint a repository's data was hosted at, plus the repository's
/// resolved tags.
#[derive(Debug, Clone)]
pub struct RepositoryData {
    pub endpoints: Vec<String>,
    pub tags: std::collections::HashMap<String, String>,
}

/// One layer in an image's ancestry, oldest-to-base ordering left to
/// the caller (the fetcher iterates parent-first itself).
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub layer_id: String,
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn get_repository_data(&self, repository: &str) -> Result<RepositoryData, RegistryError>;
    async fn get_remote_tags(
        &self,
        endpoint: &str,
        repository: &str,
    ) -> Result<std::collections::HashMap<String, String>, RegistryError>;
    async fn get_remote_history(
        &self,
        endpoint: &str,
        image_id: &str,
    ) -> Result<Vec<HistoryEntry>, RegistryError>;
    async fn get_remote_image_json(
        &self,
        endpoint: &str,
        image_id: &str,
    ) -> Result<serde_json::Value, RegistryError>;
    async fn get_remote_image_layer(
        &self,
        endpoint: &str,
        image_id: &str,
    ) -> Result<Vec<u8>, RegistryError>;
}

/// Resolves a hostname to a concrete [`RegistryClient`], mirroring the
/// original's `RegistryProvider`.
#[async_trait]
pub trait RegistryProvider: Send + Sync {
    async fn provide_registry(
        &self,
        hostname: &str,
    ) -> Result<std::sync::Arc<dyn RegistryClient>, RegistryError>;

    /// Splits `repository_name` into `(hostname, repository)`, applying
    /// the default registry hostname when none is present.
    fn apply_default_hostname(&self, repository_name: &str) -> (String, String);
}
