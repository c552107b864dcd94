//! Session execution engine.
//!
//! An [`AgentSession`] owns one logical conversation's backend identity and
//! runs at most one backend query at a time. It pulls the provider's event
//! stream, checks every tool invocation against the safety policy before it is
//! shown, forwards events to a [`RunObserver`] one at a time, and recovers
//! from a backend crash by retrying once on a fresh backend session.

pub mod manager;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendRegistry, NormalizedEvent, ProviderError, QueryOptions, QueryRequest, Usage,
};
use crate::error::{AbortReason, Error, Result};
use crate::policy::{SafetyPolicy, ThinkingPolicy};
use crate::store::SessionStore;

pub use manager::{SessionDispatcher, SessionManager};

/// A crashed first attempt gets exactly one retry.
const MAX_ATTEMPTS: u32 = 2;

/// Model used for pricing when none is configured.
const PRICING_FALLBACK_MODEL: &str = "claude-sonnet-4";

/// Receives the events of one run, in provider order.
///
/// The engine awaits every call before pulling the next event.
#[async_trait]
pub trait RunObserver: Send {
    async fn on_event(&mut self, event: &NormalizedEvent);

    /// Undo everything rendered for the current attempt; a retry follows.
    async fn rollback(&mut self);

    /// Called once when the run ends, whatever the outcome.
    async fn finish(&mut self);
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

#[async_trait]
impl RunObserver for NoopObserver {
    async fn on_event(&mut self, _event: &NormalizedEvent) {}
    async fn rollback(&mut self) {}
    async fn finish(&mut self) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Starting,
    Streaming,
    Completed,
    Aborted,
    CrashedRetrying,
    Failed,
}

impl RunState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunState::Starting | RunState::Streaming | RunState::CrashedRetrying
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ignore the stored backend handle and start a new backend session.
    pub fresh: bool,
}

/// Per-session settings.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub working_dir: PathBuf,
    /// Backend id; `None` uses the registry default.
    pub provider: Option<String>,
    pub model: Option<String>,
    pub stale_run_timeout: Option<Duration>,
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<BackendRegistry>,
    pub safety: Arc<dyn SafetyPolicy>,
    pub thinking: Arc<dyn ThinkingPolicy>,
    pub store: Arc<dyn SessionStore>,
}

#[derive(Debug, Default)]
struct SessionState {
    backend_handle: Option<String>,
    run_state: RunState,
    cancel: Option<CancellationToken>,
    stop_requested: bool,
    interrupted: bool,
    thinking_budget: u32,
    last_activity: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    last_usage: Option<Usage>,
}

/// Read-only view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: String,
    pub backend_handle: Option<String>,
    pub working_dir: PathBuf,
    pub state: RunState,
    pub thinking_budget: u32,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_usage: Option<Usage>,
}

enum StoreUpdate {
    Handle(Option<String>),
    Flush(oneshot::Sender<()>),
}

pub struct AgentSession {
    key: String,
    settings: SessionSettings,
    context: SessionContext,
    state: Mutex<SessionState>,
    store_tx: mpsc::UnboundedSender<StoreUpdate>,
}

impl AgentSession {
    /// Create a session. Must be called within a Tokio runtime: handle
    /// changes are written to the store by a background task, in order.
    pub fn new(
        key: impl Into<String>,
        settings: SessionSettings,
        context: SessionContext,
        backend_handle: Option<String>,
    ) -> Self {
        let key = key.into();
        let (store_tx, store_rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_handles(
            Arc::clone(&context.store),
            key.clone(),
            store_rx,
        ));
        Self {
            key,
            settings,
            context,
            state: Mutex::new(SessionState {
                backend_handle,
                ..Default::default()
            }),
            store_tx,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.lock().run_state.is_active()
    }

    pub fn backend_handle(&self) -> Option<String> {
        self.lock().backend_handle.clone()
    }

    pub fn snapshot(&self) -> SessionInfo {
        let state = self.lock();
        SessionInfo {
            key: self.key.clone(),
            backend_handle: state.backend_handle.clone(),
            working_dir: self.settings.working_dir.clone(),
            state: state.run_state,
            thinking_budget: state.thinking_budget,
            provider: self.settings.provider.clone(),
            model: self.settings.model.clone(),
            last_activity: state.last_activity,
            last_error: state.last_error.clone(),
            last_error_at: state.last_error_at,
            last_usage: state.last_usage.clone(),
        }
    }

    /// Request the active run to stop. Returns whether a run was in effect.
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        if !state.run_state.is_active() {
            return false;
        }
        state.stop_requested = true;
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
        info!(session = %self.key, "Stop requested");
        true
    }

    /// Flag the active run as superseded by a newer request. Does not stop it.
    pub fn mark_interrupted(&self) {
        let mut state = self.lock();
        if state.run_state.is_active() {
            state.interrupted = true;
        }
    }

    /// Forget the backend handle so the next run starts fresh.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock();
        if state.run_state.is_active() {
            return Err(Error::InvalidState(format!(
                "cannot reset session {} while a run is active",
                self.key
            )));
        }
        if state.backend_handle.take().is_some() {
            self.notify_store(None);
        }
        state.run_state = RunState::Idle;
        info!(session = %self.key, "Session reset");
        Ok(())
    }

    /// Wait until every handle change so far has reached the store.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.store_tx.send(StoreUpdate::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn notify_store(&self, handle: Option<String>) {
        if self.store_tx.send(StoreUpdate::Handle(handle)).is_err() {
            warn!(session = %self.key, "Session store writer is gone");
        }
    }

    /// Replace the backend handle, reporting actual changes to the store.
    fn set_handle(&self, handle: Option<String>) {
        let mut state = self.lock();
        if state.backend_handle != handle {
            state.backend_handle = handle.clone();
            drop(state);
            debug!(session = %self.key, handle = ?handle, "Backend handle changed");
            self.notify_store(handle);
        }
    }

    fn set_run_state(&self, run_state: RunState) {
        self.lock().run_state = run_state;
    }

    fn touch(&self) {
        self.lock().last_activity = Some(Utc::now());
    }

    pub async fn run(&self, message: &str, observer: &mut dyn RunObserver) -> Result<String> {
        self.run_with(message, RunOptions::default(), observer).await
    }

    /// Run one message to completion.
    ///
    /// # Errors
    ///
    /// - `InvalidState` when a run is already active on this session
    /// - `UnsafeOperation` when the safety policy denies a tool invocation
    /// - `BackendCrash` when the retry after a crash crashes as well
    /// - `Aborted` after [`stop`](Self::stop)
    /// - `StaleRun` when the configured run timeout elapses
    pub async fn run_with(
        &self,
        message: &str,
        options: RunOptions,
        observer: &mut dyn RunObserver,
    ) -> Result<String> {
        let budget = self.context.thinking.budget_for(message);
        let cancel = CancellationToken::new();
        {
            let mut state = self.lock();
            if state.run_state.is_active() {
                return Err(Error::InvalidState(format!(
                    "session {} already has an active run",
                    self.key
                )));
            }
            state.run_state = RunState::Starting;
            state.cancel = Some(cancel.clone());
            state.stop_requested = false;
            state.interrupted = false;
            state.thinking_budget = budget;
            state.last_activity = Some(Utc::now());
        }
        info!(session = %self.key, thinking_budget = budget, fresh = options.fresh, "Run started");

        let work = self.execute(message, budget, options.fresh, &cancel, observer);
        let result = match self.settings.stale_run_timeout {
            Some(limit) => {
                tokio::select! {
                    result = work => result,
                    _ = tokio::time::sleep(limit) => {
                        cancel.cancel();
                        Err(Error::StaleRun { elapsed: limit })
                    }
                }
            }
            None => work.await,
        };
        let result = self.classify_abort(result);

        observer.finish().await;
        self.settle(&result);
        result
    }

    /// A cancellation the caller asked for surfaces as an abort.
    fn classify_abort(&self, result: Result<String>) -> Result<String> {
        let (stop_requested, interrupted) = {
            let state = self.lock();
            (state.stop_requested, state.interrupted)
        };
        match result {
            Err(Error::Provider(e)) if e.is_cancelled() || stop_requested => {
                let reason = if interrupted {
                    AbortReason::Interrupted
                } else {
                    AbortReason::Stopped
                };
                if !stop_requested {
                    warn!(session = %self.key, "Provider cancelled without a stop request: {}", e);
                }
                Err(Error::Aborted { reason })
            }
            other => other,
        }
    }

    fn settle(&self, result: &Result<String>) {
        let mut state = self.lock();
        state.cancel = None;
        state.last_activity = Some(Utc::now());
        match result {
            Ok(text) => {
                state.run_state = RunState::Completed;
                info!(session = %self.key, chars = text.len(), "Run completed");
            }
            Err(e) if e.is_abort() => {
                state.run_state = RunState::Aborted;
                info!(session = %self.key, "Run aborted: {}", e);
            }
            Err(e) => {
                state.run_state = RunState::Failed;
                state.last_error = Some(e.to_string());
                state.last_error_at = Some(Utc::now());
                warn!(session = %self.key, "Run failed: {}", e);
            }
        }
    }

    async fn execute(
        &self,
        message: &str,
        budget: u32,
        fresh: bool,
        cancel: &CancellationToken,
        observer: &mut dyn RunObserver,
    ) -> Result<String> {
        let backend = self
            .context
            .registry
            .resolve(self.settings.provider.as_deref())
            .ok_or_else(|| {
                Error::UnknownBackend(
                    self.settings
                        .provider
                        .clone()
                        .unwrap_or_else(|| self.context.registry.default_id().to_string()),
                )
            })?;

        let mut fresh = fresh;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self
                .attempt(backend.as_ref(), message, budget, fresh, cancel, observer, attempt)
                .await;
            match outcome {
                Err(Error::Provider(e)) if e.is_crash() && !cancel.is_cancelled() => {
                    // Whatever the crashed backend session holds can't be trusted.
                    self.set_handle(None);
                    if attempt >= MAX_ATTEMPTS {
                        return Err(Error::BackendCrash { message: e.to_string() });
                    }
                    warn!(session = %self.key, attempt, "Backend crashed, retrying on a fresh session: {}", e);
                    self.set_run_state(RunState::CrashedRetrying);
                    observer.rollback().await;
                    fresh = true;
                }
                other => return other,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        backend: &dyn Backend,
        message: &str,
        budget: u32,
        fresh: bool,
        cancel: &CancellationToken,
        observer: &mut dyn RunObserver,
        attempt: u32,
    ) -> Result<String> {
        let resume = if fresh { None } else { self.backend_handle() };
        info!(
            session = %self.key,
            backend = backend.id(),
            attempt,
            resume = ?resume,
            "Starting backend query"
        );
        let request = QueryRequest {
            prompt: message.to_string(),
            options: QueryOptions {
                working_dir: self.settings.working_dir.clone(),
                resume,
                model: self.settings.model.clone(),
                max_thinking_tokens: budget,
            },
            cancel: cancel.clone(),
        };
        let mut stream = backend.create_query(request).await?;
        self.set_run_state(RunState::Streaming);

        let mut text = String::new();
        let mut handle_captured = false;
        while let Some(item) = stream.next().await {
            let event = item?;
            self.touch();
            match &event {
                NormalizedEvent::Started { backend_session_id } => {
                    if !handle_captured {
                        handle_captured = true;
                        self.set_handle(Some(backend_session_id.clone()));
                    }
                    continue;
                }
                NormalizedEvent::ToolInvocation { name, input } => {
                    let verdict = self.context.safety.check_tool(name, input);
                    if !verdict.allowed {
                        cancel.cancel();
                        let reason = verdict
                            .reason
                            .unwrap_or_else(|| format!("tool {} is not allowed", name));
                        warn!(session = %self.key, tool = %name, "Blocked tool invocation: {}", reason);
                        return Err(Error::UnsafeOperation { reason });
                    }
                    debug!(session = %self.key, tool = %name, "Tool invocation");
                }
                NormalizedEvent::TextDelta { text: delta } => text.push_str(delta),
                NormalizedEvent::Completed { usage } => {
                    let model = self
                        .settings
                        .model
                        .as_deref()
                        .unwrap_or(PRICING_FALLBACK_MODEL);
                    let usage = crate::cost::with_cost(model, usage.clone());
                    debug!(
                        session = %self.key,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        cost_usd = ?usage.cost_usd,
                        "Run usage"
                    );
                    self.lock().last_usage = Some(usage);
                }
                NormalizedEvent::Error { message } => {
                    return Err(Error::Provider(ProviderError::failed(message.clone())));
                }
                NormalizedEvent::ThinkingDelta { .. } => {}
            }
            observer.on_event(&event).await;
        }

        Ok(text)
    }
}

/// Write handle changes for one session to the store, strictly in order.
async fn persist_handles(
    store: Arc<dyn SessionStore>,
    key: String,
    mut rx: mpsc::UnboundedReceiver<StoreUpdate>,
) {
    while let Some(update) = rx.recv().await {
        match update {
            StoreUpdate::Handle(handle) => {
                if let Err(e) = store
                    .on_backend_handle_changed(&key, handle.as_deref())
                    .await
                {
                    warn!(session = %key, "Failed to persist backend handle: {}", e);
                }
            }
            StoreUpdate::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
