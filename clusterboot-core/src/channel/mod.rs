//! Message channel abstraction
//!
//! An at-least-once queue: received messages may be duplicated or
//! reordered, stay hidden for the requested visibility window and come back
//! unless deleted. A zero window leaves them visible to every reader.

pub mod memory;
pub mod sqs;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub use memory::InMemoryChannel;
pub use sqs::{SqsChannel, SqsConfig};

/// A received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Stable message id
    pub id: String,
    /// Handle for deleting this particular receipt
    pub receipt_handle: String,
    /// Payload
    pub body: String,
}

/// Queue operations the rendezvous relies on
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Queue name, for logs
    fn name(&self) -> &str;

    /// Receive up to `max_messages`, hiding them for `visibility`
    async fn receive(&self, max_messages: u32, visibility: Duration) -> Result<Vec<ChannelMessage>>;

    /// Delete a received message
    async fn delete(&self, message: &ChannelMessage) -> Result<()>;

    /// Send a message, returning its id
    async fn send(&self, body: &str) -> Result<String>;
}
