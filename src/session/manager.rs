//! Session registry and the admission controller's dispatch target.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{AgentSession, SessionContext, SessionInfo, SessionSettings};
use crate::admission::{Dispatch, RelayRequest};
use crate::delivery::{ChatTransport, DeliveryConfig, StreamingDelivery, TextFormatter};
use crate::error::{AbortReason, Error, Result};
use crate::store::StoreError;

/// One [`AgentSession`] per conversation key, created on first use and
/// seeded with the backend handle the store remembers for that key.
pub struct SessionManager {
    context: SessionContext,
    defaults: SessionSettings,
    sessions: Mutex<HashMap<String, Arc<AgentSession>>>,
}

impl SessionManager {
    pub fn new(context: SessionContext, defaults: SessionSettings) -> Self {
        Self {
            context,
            defaults,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AgentSession>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Recreate every session the store knows about. Returns how many.
    pub async fn restore(&self) -> std::result::Result<usize, StoreError> {
        let stored = self.context.store.load_all().await?;
        let mut sessions = self.sessions();
        let mut restored = 0;
        for entry in stored {
            if sessions.contains_key(&entry.key) {
                continue;
            }
            let session = AgentSession::new(
                entry.key.clone(),
                self.defaults.clone(),
                self.context.clone(),
                Some(entry.backend_handle),
            );
            sessions.insert(entry.key, Arc::new(session));
            restored += 1;
        }
        info!(restored, "Restored sessions from store");
        Ok(restored)
    }

    pub fn get(&self, key: &str) -> Option<Arc<AgentSession>> {
        self.sessions().get(key).cloned()
    }

    pub async fn get_or_create(&self, key: &str) -> Arc<AgentSession> {
        if let Some(session) = self.get(key) {
            return session;
        }
        let handle = match self.context.store.get(key).await {
            Ok(stored) => stored.map(|s| s.backend_handle),
            Err(e) => {
                warn!(session = %key, "Failed to read stored session: {}", e);
                None
            }
        };
        let mut sessions = self.sessions();
        sessions
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(session = %key, resume = ?handle, "Creating session");
                Arc::new(AgentSession::new(
                    key,
                    self.defaults.clone(),
                    self.context.clone(),
                    handle,
                ))
            })
            .clone()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions().values().map(|s| s.snapshot()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Stop every running session. Returns how many were running.
    pub fn stop_all(&self) -> usize {
        let sessions: Vec<Arc<AgentSession>> = self.sessions().values().cloned().collect();
        sessions.iter().filter(|s| s.stop()).count()
    }

    /// Wait for every pending handle change to reach the store.
    pub async fn flush_all(&self) {
        let sessions: Vec<Arc<AgentSession>> = self.sessions().values().cloned().collect();
        for session in sessions {
            session.flush().await;
        }
    }
}

/// Runs admitted requests: one run per session at a time, in arrival order,
/// optionally interrupting the active run when a new message arrives.
pub struct SessionDispatcher {
    manager: Arc<SessionManager>,
    formatter: Arc<dyn TextFormatter>,
    delivery: DeliveryConfig,
    interrupt_on_new_message: bool,
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionDispatcher {
    pub fn new(
        manager: Arc<SessionManager>,
        formatter: Arc<dyn TextFormatter>,
        delivery: DeliveryConfig,
        interrupt_on_new_message: bool,
    ) -> Self {
        Self {
            manager,
            formatter,
            delivery,
            interrupt_on_new_message,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    fn run_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.run_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Interrupt the session's active run in favour of a newer request.
    /// Returns whether a run was stopped.
    fn interrupt_active(&self, key: &str, requester: &str) -> bool {
        if !self.interrupt_on_new_message {
            return false;
        }
        let Some(session) = self.manager.get(key) else {
            return false;
        };
        if !session.is_running() {
            return false;
        }
        info!(
            session = %key,
            requester = %requester,
            "New message interrupts the active run"
        );
        session.mark_interrupted();
        session.stop()
    }

    /// Tell the requester how the run ended, when there is something to say.
    async fn report(&self, transport: &Arc<dyn ChatTransport>, result: &Result<String>) {
        let notice = match result {
            Ok(_) => None,
            Err(Error::Aborted {
                reason: AbortReason::Interrupted,
            }) => None,
            Err(Error::Aborted {
                reason: AbortReason::Stopped,
            }) => Some("🛑 Stopped.".to_string()),
            Err(Error::BackendCrash { .. }) => {
                Some("⚠️ The backend crashed, session reset. Please send your message again.".to_string())
            }
            Err(e) => Some(format!("❌ {}", e)),
        };
        if let Some(notice) = notice {
            if let Err(e) = transport.create_message(&notice).await {
                warn!("Failed to report run outcome: {}", e);
            }
        }
    }
}

#[async_trait]
impl Dispatch for SessionDispatcher {
    async fn dispatch(&self, request: RelayRequest) -> Result<String> {
        let session = self.manager.get_or_create(&request.session_key).await;
        let lock = self.run_lock(&request.session_key);

        let _guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.interrupt_active(&request.session_key, &request.requester);
                lock.lock_owned().await
            }
        };

        let mut delivery = StreamingDelivery::new(
            Arc::clone(&request.transport),
            Arc::clone(&self.formatter),
            self.delivery.clone(),
        );
        let result = session
            .run_with(&request.message, request.options.clone(), &mut delivery)
            .await;
        self.report(&request.transport, &result).await;
        result
    }

    fn session_busy(&self, request: &RelayRequest) -> bool {
        self.interrupt_active(&request.session_key, &request.requester)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionConfig, AdmissionController};
    use crate::backend::BackendRegistry;
    use crate::delivery::PlainText;
    use crate::policy::{AllowAll, KeywordThinkingPolicy};
    use crate::store::{InMemorySessionStore, SessionStore};
    use crate::testing::{
        completed, crash, eventually, started, text, RecordingTransport, ScriptedBackend, Step,
    };

    fn manager_with(
        scripts: Vec<Vec<Step>>,
        store: Arc<InMemorySessionStore>,
    ) -> (Arc<SessionManager>, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new("scripted", scripts));
        let mut registry = BackendRegistry::new("scripted");
        registry.register(backend.clone());
        let context = SessionContext {
            registry: Arc::new(registry),
            safety: Arc::new(AllowAll),
            thinking: Arc::new(KeywordThinkingPolicy::default()),
            store,
        };
        (
            Arc::new(SessionManager::new(context, SessionSettings::default())),
            backend,
        )
    }

    fn dispatcher(manager: &Arc<SessionManager>, interrupt: bool) -> SessionDispatcher {
        SessionDispatcher::new(
            manager.clone(),
            Arc::new(PlainText),
            DeliveryConfig::default(),
            interrupt,
        )
    }

    #[tokio::test]
    async fn test_sessions_resume_stored_handles() {
        let store = Arc::new(InMemorySessionStore::new());
        store
            .on_backend_handle_changed("chat-1", Some("persisted"))
            .await
            .unwrap();
        let (manager, backend) = manager_with(vec![vec![completed()]], store);

        assert_eq!(manager.restore().await.unwrap(), 1);
        let session = manager.get_or_create("chat-1").await;
        assert_eq!(session.backend_handle().as_deref(), Some("persisted"));
        assert!(Arc::ptr_eq(&session, &manager.get_or_create("chat-1").await));

        session
            .run("hello", &mut crate::session::NoopObserver)
            .await
            .unwrap();
        assert_eq!(backend.requests()[0].resume.as_deref(), Some("persisted"));
        assert_eq!(manager.list().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_delivers_text() {
        let (manager, _) = manager_with(
            vec![vec![started("s"), text("Hi there"), completed()]],
            Arc::new(InMemorySessionStore::new()),
        );
        let d = dispatcher(&manager, true);
        let transport = Arc::new(RecordingTransport::new());
        let result = d
            .dispatch(RelayRequest::new("chat", "user", "hello", transport.clone()))
            .await
            .unwrap();
        assert_eq!(result, "Hi there");
        assert_eq!(transport.visible(), vec!["Hi there".to_string()]);
    }

    #[tokio::test]
    async fn test_double_crash_is_reported() {
        let (manager, _) = manager_with(
            vec![vec![crash("one")], vec![crash("two")]],
            Arc::new(InMemorySessionStore::new()),
        );
        let d = dispatcher(&manager, true);
        let transport = Arc::new(RecordingTransport::new());
        let err = d
            .dispatch(RelayRequest::new("chat", "user", "hello", transport.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendCrash { .. }));
        assert_eq!(transport.visible().len(), 1);
        assert!(transport.visible()[0].contains("session reset"));
    }

    #[tokio::test]
    async fn test_new_message_interrupts_running_session() {
        let (manager, _) = manager_with(
            vec![
                vec![started("s"), text("working"), Step::Hang],
                vec![started("s"), text("second answer"), completed()],
            ],
            Arc::new(InMemorySessionStore::new()),
        );
        let d = Arc::new(dispatcher(&manager, true));
        let first_transport = Arc::new(RecordingTransport::new());
        let first = {
            let d = d.clone();
            let t = first_transport.clone();
            tokio::spawn(async move { d.dispatch(RelayRequest::new("chat", "user", "one", t)).await })
        };
        eventually(|| !first_transport.visible().is_empty()).await;

        let second_transport = Arc::new(RecordingTransport::new());
        let second = d
            .dispatch(RelayRequest::new("chat", "user", "two", second_transport.clone()))
            .await
            .unwrap();
        assert_eq!(second, "second answer");

        let first = first.await.unwrap().unwrap_err();
        assert_eq!(first.abort_reason(), Some(AbortReason::Interrupted));
        // An interrupted run posts no outcome notice.
        assert_eq!(first_transport.visible(), vec!["working".to_string()]);
        assert_eq!(second_transport.visible(), vec!["second answer".to_string()]);
    }

    #[tokio::test]
    async fn test_same_session_runs_serialize_without_interrupt() {
        let (manager, backend) = manager_with(
            vec![
                vec![started("s"), Step::Sleep(std::time::Duration::from_millis(20)), completed()],
                vec![started("s"), completed()],
            ],
            Arc::new(InMemorySessionStore::new()),
        );
        let d = Arc::new(dispatcher(&manager, false));
        let transport = Arc::new(RecordingTransport::new());
        let first = {
            let d = d.clone();
            let t = transport.clone();
            tokio::spawn(async move { d.dispatch(RelayRequest::new("chat", "user", "one", t)).await })
        };
        eventually(|| manager.get("chat").map_or(false, |s| s.is_running())).await;

        let second = d
            .dispatch(RelayRequest::new("chat", "user", "two", transport.clone()))
            .await;
        assert!(second.is_ok());
        assert!(first.await.unwrap().is_ok());
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_is_reported() {
        let (manager, _) = manager_with(
            vec![vec![started("s"), Step::Hang]],
            Arc::new(InMemorySessionStore::new()),
        );
        let d = Arc::new(dispatcher(&manager, true));
        let transport = Arc::new(RecordingTransport::new());
        let run = {
            let d = d.clone();
            let t = transport.clone();
            tokio::spawn(async move { d.dispatch(RelayRequest::new("chat", "user", "go", t)).await })
        };
        eventually(|| manager.get("chat").map_or(false, |s| s.is_running())).await;

        assert_eq!(manager.stop_all(), 1);
        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::Stopped));
        assert_eq!(transport.created_texts(), vec!["🛑 Stopped.".to_string()]);
    }

    #[tokio::test]
    async fn test_controller_interrupts_busy_session_without_extra_slot() {
        let (manager, _) = manager_with(
            vec![
                vec![started("s"), text("working"), Step::Hang],
                vec![started("s"), text("second answer"), completed()],
            ],
            Arc::new(InMemorySessionStore::new()),
        );
        let controller = AdmissionController::new(
            AdmissionConfig {
                max_concurrent: 2,
                max_queue_size: 5,
            },
            Arc::new(dispatcher(&manager, true)),
        );
        let first_transport = Arc::new(RecordingTransport::new());
        let first = {
            let c = controller.clone();
            let t = first_transport.clone();
            tokio::spawn(async move { c.submit(RelayRequest::new("chat", "user", "one", t)).await })
        };
        eventually(|| !first_transport.visible().is_empty()).await;
        assert_eq!(controller.status().in_flight, 1);

        let second_transport = Arc::new(RecordingTransport::new());
        let second = controller
            .submit(RelayRequest::new("chat", "user", "two", second_transport.clone()))
            .await
            .unwrap();
        assert_eq!(second, "second answer");

        let first = first.await.unwrap().unwrap_err();
        assert_eq!(first.abort_reason(), Some(AbortReason::Interrupted));
        // The interrupted run frees the session, so no waiting notice.
        assert_eq!(second_transport.visible(), vec!["second answer".to_string()]);
        assert_eq!(controller.status().in_flight, 0);
    }
}
