//! Signed HTTP client shared by the AWS service clients

use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::credentials::CredentialsProvider;
use super::sigv4::{sign_post, SigningParams};
use crate::error::{BootstrapError, Result};

/// Timeouts applied to every AWS request
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Whole-request timeout
    pub request_timeout: Duration,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Services the bootstrap talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwsService {
    Sqs,
    Ec2,
    AutoScaling,
}

impl AwsService {
    /// Name used in the signing scope and the default host
    pub fn signing_name(&self) -> &'static str {
        match self {
            AwsService::Sqs => "sqs",
            AwsService::Ec2 => "ec2",
            AwsService::AutoScaling => "autoscaling",
        }
    }

    /// Regional endpoint
    pub fn default_endpoint(&self, region: &str) -> String {
        format!("https://{}.{}.amazonaws.com", self.signing_name(), region)
    }
}

/// Raw response of a signed call
#[derive(Debug)]
pub struct AwsResponse {
    pub status: StatusCode,
    pub body: String,
}

/// Client for one AWS service endpoint
pub struct ServiceClient {
    client: Client,
    service: AwsService,
    region: String,
    endpoint: Url,
    host: String,
    credentials: Arc<dyn CredentialsProvider>,
}

impl ServiceClient {
    /// Create a client; `endpoint` overrides the regional default
    pub fn new(
        service: AwsService,
        region: &str,
        endpoint: Option<&str>,
        http: &HttpConfig,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Result<Self> {
        let raw = endpoint
            .map(str::to_string)
            .unwrap_or_else(|| service.default_endpoint(region));
        let endpoint = Url::parse(&raw).map_err(|e| BootstrapError::InvalidConfig {
            key: format!("{} endpoint", service.signing_name()),
            reason: format!("{}: {}", raw, e),
        })?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(BootstrapError::InvalidConfig {
                    key: format!("{} endpoint", service.signing_name()),
                    reason: format!("{} has no host", raw),
                })
            }
        };

        let client = Client::builder()
            .timeout(http.request_timeout)
            .connect_timeout(http.connect_timeout)
            .build()
            .map_err(|e| BootstrapError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            service,
            region: region.to_string(),
            endpoint,
            host,
            credentials,
        })
    }

    /// Endpoint this client sends to
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Service this client talks to
    pub fn service(&self) -> AwsService {
        self.service
    }

    /// Send a signed POST to `/`
    pub async fn post(
        &self,
        content_type: &str,
        extra_headers: &[(&str, &str)],
        body: String,
    ) -> Result<AwsResponse> {
        let credentials = self.credentials.credentials().await?;
        let params = SigningParams {
            credentials: &credentials,
            region: &self.region,
            service: self.service.signing_name(),
            time: Utc::now(),
        };

        let mut headers = vec![("content-type", content_type)];
        headers.extend_from_slice(extra_headers);
        let signed = sign_post(&params, &self.host, &headers, body.as_bytes());

        let mut request = self.client.post(self.endpoint.clone());
        for (name, value) in &signed {
            request = request.header(name.as_str(), value.as_str());
        }

        let resp = request
            .body(body)
            .send()
            .await
            .map_err(|e| BootstrapError::ConnectionFailed {
                endpoint: self.endpoint.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| BootstrapError::ConnectionFailed {
            endpoint: self.endpoint.to_string(),
            reason: format!("failed to read response body: {}", e),
        })?;

        debug!("{} responded {}", self.service.signing_name(), status);
        Ok(AwsResponse { status, body })
    }
}
