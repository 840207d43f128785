//! Hosted queue channel over the SQS JSON protocol

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{ChannelMessage, MessageChannel};
use crate::aws::{AwsResponse, ServiceClient};
use crate::error::{BootstrapError, Result};

const CONTENT_TYPE: &str = "application/x-amz-json-1.0";

/// Configuration for an SQS-backed channel
#[derive(Debug, Clone)]
pub struct SqsConfig {
    /// Queue name; the URL is looked up on first use
    pub queue_name: String,
    /// Long-poll wait per receive call (0 = short poll)
    pub wait_time: Duration,
}

impl SqsConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            wait_time: Duration::ZERO,
        }
    }
}

/// Message channel backed by an SQS queue
pub struct SqsChannel {
    client: ServiceClient,
    config: SqsConfig,
    queue_url: OnceCell<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueueUrlRequest<'a> {
    queue_name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueueUrlResponse {
    queue_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageRequest<'a> {
    queue_url: &'a str,
    max_number_of_messages: u32,
    visibility_timeout: u64,
    wait_time_seconds: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageResponse {
    #[serde(default)]
    messages: Vec<SqsMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SqsMessage {
    message_id: String,
    receipt_handle: String,
    #[serde(default)]
    body: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteMessageRequest<'a> {
    queue_url: &'a str,
    receipt_handle: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageRequest<'a> {
    queue_url: &'a str,
    message_body: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageResponse {
    message_id: String,
}

#[derive(Deserialize)]
struct SqsErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

impl SqsChannel {
    /// Create a channel for the configured queue
    pub fn new(client: ServiceClient, config: SqsConfig) -> Self {
        Self {
            client,
            config,
            queue_url: OnceCell::new(),
        }
    }

    async fn call<Req: Serialize>(&self, action: &str, request: &Req) -> Result<AwsResponse> {
        let body = serde_json::to_string(request).map_err(|e| BootstrapError::Internal {
            message: format!("Failed to encode {} request: {}", action, e),
        })?;
        let target = format!("AmazonSQS.{}", action);
        let resp = self
            .client
            .post(CONTENT_TYPE, &[("x-amz-target", target.as_str())], body)
            .await?;

        if !resp.status.is_success() {
            return Err(service_error(action, &resp));
        }
        Ok(resp)
    }

    async fn call_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        action: &str,
        request: &Req,
    ) -> Result<Resp> {
        let resp = self.call(action, request).await?;
        serde_json::from_str(&resp.body).map_err(|e| BootstrapError::ServiceError {
            service: "sqs".into(),
            code: "MalformedResponse".into(),
            message: format!("{} response could not be decoded: {}", action, e),
            status: resp.status.as_u16(),
        })
    }

    async fn queue_url(&self) -> Result<&str> {
        let url = self
            .queue_url
            .get_or_try_init(|| async {
                let resp: GetQueueUrlResponse = self
                    .call_json(
                        "GetQueueUrl",
                        &GetQueueUrlRequest {
                            queue_name: &self.config.queue_name,
                        },
                    )
                    .await?;
                info!("Resolved queue {} to {}", self.config.queue_name, resp.queue_url);
                Ok::<_, BootstrapError>(resp.queue_url)
            })
            .await?;
        Ok(url.as_str())
    }
}

fn service_error(action: &str, resp: &AwsResponse) -> BootstrapError {
    let parsed: Option<SqsErrorBody> = serde_json::from_str(&resp.body).ok();
    let (code, message) = match parsed {
        Some(err) => {
            let code = err.kind.rsplit('#').next().unwrap_or_default().to_string();
            (code, err.message)
        }
        None => (resp.status.as_str().to_string(), resp.body.clone()),
    };
    BootstrapError::ServiceError {
        service: "sqs".into(),
        code,
        message: format!("{}: {}", action, message),
        status: resp.status.as_u16(),
    }
}

#[async_trait]
impl MessageChannel for SqsChannel {
    fn name(&self) -> &str {
        &self.config.queue_name
    }

    async fn receive(&self, max_messages: u32, visibility: Duration) -> Result<Vec<ChannelMessage>> {
        let queue_url = self.queue_url().await?;
        let resp: ReceiveMessageResponse = self
            .call_json(
                "ReceiveMessage",
                &ReceiveMessageRequest {
                    queue_url,
                    max_number_of_messages: max_messages,
                    visibility_timeout: visibility.as_secs(),
                    wait_time_seconds: self.config.wait_time.as_secs(),
                },
            )
            .await?;

        debug!("{}: received {} messages", self.config.queue_name, resp.messages.len());
        Ok(resp
            .messages
            .into_iter()
            .map(|m| ChannelMessage {
                id: m.message_id,
                receipt_handle: m.receipt_handle,
                body: m.body,
            })
            .collect())
    }

    async fn delete(&self, message: &ChannelMessage) -> Result<()> {
        let queue_url = self.queue_url().await?;
        self.call(
            "DeleteMessage",
            &DeleteMessageRequest {
                queue_url,
                receipt_handle: &message.receipt_handle,
            },
        )
        .await?;
        debug!("{}: deleted message {}", self.config.queue_name, message.id);
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<String> {
        let queue_url = self.queue_url().await?;
        let resp: SendMessageResponse = self
            .call_json(
                "SendMessage",
                &SendMessageRequest {
                    queue_url,
                    message_body: body,
                },
            )
            .await?;
        Ok(resp.message_id)
    }
}
