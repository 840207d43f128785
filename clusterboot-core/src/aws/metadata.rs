//! Instance metadata client (IMDSv2)
//!
//! Fetches a session token, then reads metadata paths with it. When the
//! token endpoint is unavailable, requests fall back to unauthenticated
//! IMDSv1 reads.

use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

use super::credentials::RoleCredentials;
use crate::error::{BootstrapError, Result};

/// Configuration for the metadata client
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// Base URL of the metadata service
    pub endpoint: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Session token lifetime in seconds
    pub token_ttl_secs: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://169.254.169.254".into(),
            request_timeout: Duration::from_secs(30),
            token_ttl_secs: 21600,
        }
    }
}

/// Client for the local instance metadata service
pub struct InstanceMetadataClient {
    client: Client,
    config: MetadataConfig,
}

impl InstanceMetadataClient {
    /// Create a new metadata client
    pub fn new(config: MetadataConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| BootstrapError::Internal {
                message: format!("Failed to create metadata HTTP client: {}", e),
            })?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/latest/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn connection_error(&self, e: reqwest::Error) -> BootstrapError {
        BootstrapError::ConnectionFailed {
            endpoint: self.config.endpoint.clone(),
            reason: e.to_string(),
        }
    }

    async fn session_token(&self) -> Result<Option<String>> {
        let resp = self
            .client
            .put(self.url("api/token"))
            .header(
                "X-aws-ec2-metadata-token-ttl-seconds",
                self.config.token_ttl_secs.to_string(),
            )
            .send()
            .await
            .map_err(|e| self.connection_error(e))?;

        if !resp.status().is_success() {
            warn!("Metadata token request returned {}, using IMDSv1", resp.status());
            return Ok(None);
        }

        let token = resp.text().await.map_err(|e| self.connection_error(e))?;
        Ok(Some(token))
    }

    /// Read a metadata path. `None` when the path does not exist.
    pub async fn get(&self, path: &str) -> Result<Option<String>> {
        let token = self.session_token().await?;
        let mut request = self.client.get(self.url(path));
        if let Some(token) = &token {
            request = request.header("X-aws-ec2-metadata-token", token);
        }

        let resp = request.send().await.map_err(|e| self.connection_error(e))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            debug!("Metadata path {} not found", path);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(BootstrapError::ServiceError {
                service: "instance-metadata".into(),
                code: status.as_str().into(),
                message: format!("GET {} failed", path),
                status: status.as_u16(),
            });
        }

        let body = resp.text().await.map_err(|e| self.connection_error(e))?;
        Ok(Some(body))
    }

    /// Transient credential record of an instance role, if attached
    pub async fn role_credentials(&self, role: &str) -> Result<Option<RoleCredentials>> {
        let path = format!("meta-data/iam/security-credentials/{}", role);
        let Some(body) = self.get(&path).await? else {
            return Ok(None);
        };

        let record = serde_json::from_str(&body).map_err(|e| BootstrapError::InvalidMessage {
            reason: format!("malformed credential record for role {}: {}", role, e),
        })?;
        Ok(Some(record))
    }

    /// Id of this instance
    pub async fn instance_id(&self) -> Result<String> {
        self.required("meta-data/instance-id").await
    }

    /// Type of this instance (e.g. `p3.2xlarge`)
    pub async fn instance_type(&self) -> Result<String> {
        self.required("meta-data/instance-type").await
    }

    async fn required(&self, path: &str) -> Result<String> {
        self.get(path)
            .await?
            .map(|value| value.trim().to_string())
            .ok_or_else(|| BootstrapError::ServiceError {
                service: "instance-metadata".into(),
                code: "404".into(),
                message: format!("{} missing", path),
                status: 404,
            })
    }
}
