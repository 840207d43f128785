//! In-process message channel
//!
//! Implements the same visibility-window semantics as the hosted queue so
//! coordinators can run against it locally and in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{ChannelMessage, MessageChannel};
use crate::error::{BootstrapError, Result};

struct StoredMessage {
    id: String,
    body: String,
    /// Receipt handle of the latest delivery
    receipt_handle: Option<String>,
    invisible_until: Option<Instant>,
    receive_count: u32,
}

/// Queue held in memory.
///
/// Delivery follows insertion order, so a message left on the queue comes
/// back ahead of newer ones once its window lapses. Hosted queues give no
/// ordering guarantee and nothing built on `MessageChannel` may rely on it.
pub struct InMemoryChannel {
    name: String,
    messages: Mutex<Vec<StoredMessage>>,
}

impl InMemoryChannel {
    /// Create an empty channel
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a raw body, as an external producer would
    pub fn push(&self, body: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        self.messages.lock().push(StoredMessage {
            id: id.clone(),
            body: body.into(),
            receipt_handle: None,
            invisible_until: None,
            receive_count: 0,
        });
        id
    }

    /// Messages still stored, visible or not
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How often the message with `id` has been delivered
    pub fn receive_count(&self, id: &str) -> Option<u32> {
        self.messages
            .lock()
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.receive_count)
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, max_messages: u32, visibility: Duration) -> Result<Vec<ChannelMessage>> {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        let mut batch = Vec::new();

        for stored in messages.iter_mut() {
            if batch.len() >= max_messages as usize {
                break;
            }
            if stored.invisible_until.is_some_and(|until| until > now) {
                continue;
            }

            let handle = Uuid::new_v4().to_string();
            stored.receipt_handle = Some(handle.clone());
            stored.receive_count += 1;
            stored.invisible_until = if visibility.is_zero() {
                None
            } else {
                Some(now + visibility)
            };

            batch.push(ChannelMessage {
                id: stored.id.clone(),
                receipt_handle: handle,
                body: stored.body.clone(),
            });
        }

        debug!("{}: delivered {} messages", self.name, batch.len());
        Ok(batch)
    }

    async fn delete(&self, message: &ChannelMessage) -> Result<()> {
        let mut messages = self.messages.lock();
        let position = messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(message.receipt_handle.as_str()));

        match position {
            Some(index) => {
                messages.remove(index);
                Ok(())
            }
            None if messages.iter().any(|m| m.id == message.id) => {
                Err(BootstrapError::ServiceError {
                    service: self.name.clone(),
                    code: "ReceiptHandleIsInvalid".into(),
                    message: format!("stale receipt handle for message {}", message.id),
                    status: 400,
                })
            }
            // Already deleted through another receipt
            None => Ok(()),
        }
    }

    async fn send(&self, body: &str) -> Result<String> {
        Ok(self.push(body))
    }
}
