//! Persistence collaborator for backend session handles.
//!
//! The execution engine reports every backend-handle change here so that a
//! restarted relay can resume each conversation where it left off.

mod file;
mod memory;

pub use file::FileSessionStore;
pub use memory::InMemorySessionStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session store serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A persisted resumable backend session for one conversation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub key: String,
    pub backend_handle: String,
    /// RFC3339 timestamp of the last handle change.
    pub updated_at: String,
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Whether the store survives a restart.
    fn is_persistent(&self) -> bool;

    /// Record a new backend handle for `key`; `None` forgets it.
    async fn on_backend_handle_changed(
        &self,
        key: &str,
        handle: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<StoredSession>, StoreError>;

    /// Every stored session, oldest change first.
    async fn load_all(&self) -> Result<Vec<StoredSession>, StoreError>;
}

/// Create a file-backed store when a path is configured, in-memory otherwise.
pub async fn create_session_store(
    path: Option<PathBuf>,
) -> Result<Arc<dyn SessionStore>, StoreError> {
    match path {
        Some(path) => Ok(Arc::new(FileSessionStore::new(path).await?)),
        None => Ok(Arc::new(InMemorySessionStore::new())),
    }
}
