//! `reqwest`-backed [`RegistryClient`], speaking the Docker Registry
//! v1-style endpoints `old/repository_fetcher.go` used. Full registry
//! v2 auth flows are out of scope.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;

use super::{HistoryEntry, RegistryClient, RegistryError, RegistryProvider, RepositoryData};

const DEFAULT_HOSTNAME: &str = "index.docker.io";

pub struct HttpRegistryClient {
    endpoint: String,
    http: Client,
}

impl HttpRegistryClient {
    pub fn new(endpoint: impl Into<String>, http: Client) -> Self {
        Self {
            endpoint: endpoint.into(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, RegistryError> {
        let url = self.url(path);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::UnexpectedStatus {
                endpoint: url,
                status: response.status(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn get_repository_data(&self, repository: &str) -> Result<RepositoryData, RegistryError> {
        let url = self.url(&format!("/v1/repositories/{repository}/images"));
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::UnexpectedStatus {
                endpoint: url,
                status: response.status(),
            });
        }

        let endpoints: Vec<String> = response
            .headers()
            .get("x-docker-endpoints")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|| vec![self.endpoint.clone()]);

        let tags = self.get_remote_tags(&self.endpoint, repository).await?;

        Ok(RepositoryData { endpoints, tags })
    }

    async fn get_remote_tags(
        &self,
        endpoint: &str,
        repository: &str,
    ) -> Result<HashMap<String, String>, RegistryError> {
        let client = if endpoint == self.endpoint {
            None
        } else {
            Some(HttpRegistryClient::new(endpoint, self.http.clone()))
        };
        let target = client.as_ref().unwrap_or(self);

        let value = target
            .get_json(&format!("/v1/repositories/{repository}/tags"))
            .await?;

        serde_json::from_value(value)
            .map_err(|e| RegistryError::MalformedResponse(e.to_string()))
    }

    async fn get_remote_history(
        &self,
        endpoint: &str,
        image_id: &str,
    ) -> Result<Vec<HistoryEntry>, RegistryError> {
        let client = if endpoint == self.endpoint {
            None
        } else {
            Some(HttpRegistryClient::new(endpoint, self.http.clone()))
        };
        let target = client.as_ref().unwrap_or(self);

        let value = target
            .get_json(&format!("/v1/images/{image_id}/ancestry"))
            .await?;

        let ids: Vec<String> = serde_json::from_value(value)
            .map_err(|e| RegistryError::MalformedResponse(e.to_string()))?;

        Ok(ids.into_iter().map(|layer_id| HistoryEntry { layer_id }).collect())
    }

    async fn get_remote_image_json(
        &self,
        endpoint: &str,
        image_id: &str,
    ) -> Result<serde_json::Value, RegistryError> {
        let client = if endpoint == self.endpoint {
            None
        } else {
            Some(HttpRegistryClient::new(endpoint, self.http.clone()))
        };
        let target = client.as_ref().unwrap_or(self);
        target.get_json(&format!("/v1/images/{image_id}/json")).await
    }

    async fn get_remote_image_layer(
        &self,
        endpoint: &str,
        image_id: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let client = if endpoint == self.endpoint {
            None
        } else {
            Some(HttpRegistryClient::new(endpoint, self.http.clone()))
        };
        let target = client.as_ref().unwrap_or(self);

        let url = target.url(&format!("/v1/images/{image_id}/layer"));
        let response = target.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::UnexpectedStatus {
                endpoint: url,
                status: response.status(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Resolves any hostname to an [`HttpRegistryClient`] pointed at
/// `https://{hostname}`, defaulting to the Docker Hub index.
pub struct DefaultRegistryProvider {
    http: Client,
}

impl DefaultRegistryProvider {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl RegistryProvider for DefaultRegistryProvider {
    async fn provide_registry(
        &self,
        hostname: &str,
    ) -> Result<Arc<dyn RegistryClient>, RegistryError> {
        Ok(Arc::new(HttpRegistryClient::new(
            format!("https://{hostname}"),
            self.http.clone(),
        )))
    }

    fn apply_default_hostname(&self, repository_name: &str) -> (String, String) {
        match repository_name.split_once('/') {
            Some((host, rest)) if host.contains('.') || host.contains(':') => {
                (host.to_string(), rest.to_string())
            }
            _ => (DEFAULT_HOSTNAME.to_string(), repository_name.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_hostname_applied_when_repository_has_no_registry_prefix() {
        let provider = DefaultRegistryProvider::new(Client::new());
        let (host, repo) = provider.apply_default_hostname("library/ubuntu");
        assert_eq!(host, DEFAULT_HOSTNAME);
        assert_eq!(repo, "library/ubuntu");
    }

    #[test]
    fn explicit_registry_prefix_is_preserved() {
        let provider = DefaultRegistryProvider::new(Client::new());
        let (host, repo) = provider.apply_default_hostname("registry.example.com/team/app");
        assert_eq!(host, "registry.example.com");
        assert_eq!(repo, "team/app");
    }
}
