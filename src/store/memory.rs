//! In-memory session store (non-persistent).

use super::{now_string, SessionStore, StoreError, StoredSession};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, StoredSession>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn on_backend_handle_changed(
        &self,
        key: &str,
        handle: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        match handle {
            Some(handle) => {
                sessions.insert(
                    key.to_string(),
                    StoredSession {
                        key: key.to_string(),
                        backend_handle: handle.to_string(),
                        updated_at: now_string(),
                    },
                );
            }
            None => {
                sessions.remove(key);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredSession>, StoreError> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn load_all(&self) -> Result<Vec<StoredSession>, StoreError> {
        let mut sessions: Vec<StoredSession> =
            self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(sessions)
    }
}
