//! JSON file-based session store.

use super::{now_string, SessionStore, StoreError, StoredSession};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Serialize, Deserialize, Default)]
struct SessionStoreSnapshot {
    sessions: HashMap<String, StoredSession>,
}

#[derive(Clone)]
pub struct FileSessionStore {
    path: PathBuf,
    sessions: Arc<RwLock<HashMap<String, StoredSession>>>,
    persist_lock: Arc<Mutex<()>>,
}

impl FileSessionStore {
    /// Open (or start) the snapshot at `path`. An unreadable snapshot is
    /// logged and replaced rather than failing startup.
    pub async fn new(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let snapshot = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<SessionStoreSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("Failed to parse session store {}: {}", path.display(), e);
                    SessionStoreSnapshot::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                SessionStoreSnapshot::default()
            }
            Err(err) => {
                tracing::warn!("Failed to read session store {}: {}", path.display(), err);
                SessionStoreSnapshot::default()
            }
        };
        tracing::debug!(
            path = %path.display(),
            sessions = snapshot.sessions.len(),
            "Loaded session store"
        );

        Ok(Self {
            path,
            sessions: Arc::new(RwLock::new(snapshot.sessions)),
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = SessionStoreSnapshot {
            sessions: self.sessions.read().await.clone(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn on_backend_handle_changed(
        &self,
        key: &str,
        handle: Option<&str>,
    ) -> Result<(), StoreError> {
        {
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
                    if sessions.remove(key).is_none() {
                        return Ok(());
                    }
                }
            }
        }
        self.persist().await
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
