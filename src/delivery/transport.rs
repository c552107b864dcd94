//! Chat surface primitives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Opaque id of a message rendered on the chat surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle(pub String);

impl std::fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Message not found: {0}")]
    NotFound(MessageHandle),

    #[error("Rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("Transport failed: {0}")]
    Failed(String),
}

/// Send/edit/delete primitives of one conversation on the chat surface.
/// Each call is independently fallible.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn create_message(&self, text: &str) -> Result<MessageHandle, TransportError>;

    /// Replace the full content of a message.
    async fn edit_message(&self, handle: &MessageHandle, text: &str)
        -> Result<(), TransportError>;

    async fn delete_message(&self, handle: &MessageHandle) -> Result<(), TransportError>;
}

/// Prints every operation to stdout.
pub struct ConsoleTransport {
    label: String,
    next_id: AtomicU64,
}

impl ConsoleTransport {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn create_message(&self, text: &str) -> Result<MessageHandle, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = MessageHandle(format!("{}-{}", self.label, id));
        println!("[{}] {}", handle, text);
        Ok(handle)
    }

    async fn edit_message(
        &self,
        handle: &MessageHandle,
        text: &str,
    ) -> Result<(), TransportError> {
        println!("[{} edited] {}", handle, text);
        Ok(())
    }

    async fn delete_message(&self, handle: &MessageHandle) -> Result<(), TransportError> {
        println!("[{} deleted]", handle);
        Ok(())
    }
}
