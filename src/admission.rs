//! Admission control: a global cap on concurrent backend runs with a bounded
//! FIFO queue in front of it.
//!
//! A request either dispatches at once, waits in the queue (its transport is
//! told its position), or is rejected because the queue is full. A request
//! for a session that already holds a slot waits in that session's pending
//! list instead, without taking a second slot, so the in-flight count always
//! equals the number of sessions running. All shared state sits under one
//! synchronous lock, and every check-and-increment happens without a
//! suspension point in between.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::delivery::ChatTransport;
use crate::error::{Error, Result};
use crate::session::RunOptions;

/// One inbound chat request.
#[derive(Clone)]
pub struct RelayRequest {
    pub message: String,
    pub requester: String,
    pub session_key: String,
    pub transport: Arc<dyn ChatTransport>,
    pub options: RunOptions,
}

impl RelayRequest {
    pub fn new(
        session_key: impl Into<String>,
        requester: impl Into<String>,
        message: impl Into<String>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            message: message.into(),
            requester: requester.into(),
            session_key: session_key.into(),
            transport,
            options: RunOptions::default(),
        }
    }

    async fn notify(&self, text: &str) {
        if let Err(e) = self.transport.create_message(text).await {
            warn!(session = %self.session_key, "Failed to send notice: {}", e);
        }
    }
}

/// Runs an admitted request to completion.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: RelayRequest) -> Result<String>;

    /// A request arrived for a session whose run holds a slot. Returns
    /// whether that run was interrupted in favour of the new request.
    ///
    /// Called with the admission state locked; must not block.
    fn session_busy(&self, _request: &RelayRequest) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_size: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: usize,
    /// Requests waiting for their own session's run to finish.
    pub pending: usize,
    /// Bound on `queued + pending`.
    pub max_size: usize,
    /// How long the oldest waiting entry has waited; `None` when nothing waits.
    pub oldest_wait: Option<Duration>,
    pub in_flight: usize,
    pub max_concurrent: usize,
}

struct QueueEntry {
    request: RelayRequest,
    enqueued_at: Instant,
    respond: oneshot::Sender<Result<String>>,
}

/// Insert keeping `list` ordered by arrival.
fn insert_by_age(list: &mut VecDeque<QueueEntry>, entry: QueueEntry) {
    let at = list
        .iter()
        .position(|e| e.enqueued_at > entry.enqueued_at)
        .unwrap_or(list.len());
    list.insert(at, entry);
}

#[derive(Default)]
struct State {
    in_flight: usize,
    queue: VecDeque<QueueEntry>,
    /// Sessions holding an in-flight slot.
    running: HashSet<String>,
    /// Requests for a running session, oldest first. Every key is in `running`.
    pending: HashMap<String, VecDeque<QueueEntry>>,
    draining: bool,
    /// A completion arrived mid-drain; run another pass.
    redrain: bool,
}

impl State {
    fn waiting(&self) -> usize {
        self.queue.len() + self.pending.values().map(VecDeque::len).sum::<usize>()
    }

    fn take_slot(&mut self, session_key: &str) {
        self.in_flight += 1;
        self.running.insert(session_key.to_string());
    }

    fn park(&mut self, entry: QueueEntry) {
        let list = self
            .pending
            .entry(entry.request.session_key.clone())
            .or_default();
        insert_by_age(list, entry);
    }
}

struct Inner {
    config: AdmissionConfig,
    dispatcher: Arc<dyn Dispatch>,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_run_completed(self: &Arc<Self>, session_key: &str) {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.in_flight = state.in_flight.saturating_sub(1);
            state.running.remove(session_key);
            // The session is free again; its pending requests compete for
            // slots in arrival order with everything else.
            if let Some(pending) = state.pending.remove(session_key) {
                for entry in pending {
                    insert_by_age(&mut state.queue, entry);
                }
            }
            if state.draining {
                state.redrain = true;
                return;
            }
            state.draining = true;
        }
        self.drain();
    }

    /// Dispatch queued entries, oldest first, while slots are free.
    fn drain(self: &Arc<Self>) {
        loop {
            let next = {
                let mut guard = self.lock();
                let state = &mut *guard;
                let mut next = None;
                while state.in_flight < self.config.max_concurrent {
                    let Some(entry) = state.queue.pop_front() else {
                        break;
                    };
                    if entry.respond.is_closed() {
                        debug!(session = %entry.request.session_key, "Skipping abandoned queue entry");
                        continue;
                    }
                    if state.running.contains(&entry.request.session_key) {
                        state.park(entry);
                        continue;
                    }
                    state.take_slot(&entry.request.session_key);
                    next = Some(entry);
                    break;
                }
                if next.is_none() {
                    if state.redrain {
                        state.redrain = false;
                        continue;
                    }
                    state.draining = false;
                }
                next
            };
            let Some(entry) = next else {
                return;
            };

            debug!(
                session = %entry.request.session_key,
                waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                "Dispatching queued request"
            );
            let guard = InFlightGuard {
                inner: Arc::clone(self),
                session_key: entry.request.session_key.clone(),
            };
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                let result = dispatcher.dispatch(entry.request).await;
                drop(guard);
                let _ = entry.respond.send(result);
            });
        }
    }
}

/// Holds one in-flight slot for a session; releasing it drains the queue.
struct InFlightGuard {
    inner: Arc<Inner>,
    session_key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.on_run_completed(&self.session_key);
    }
}

enum Admission {
    Run(InFlightGuard),
    Queued {
        rx: oneshot::Receiver<Result<String>>,
        position: usize,
        in_flight: usize,
    },
    Pending {
        rx: oneshot::Receiver<Result<String>>,
        interrupted: bool,
    },
    Full {
        current: usize,
        max: usize,
    },
}

/// Wait for a queued or pending entry's result.
async fn wait_for(caller: &RelayRequest, rx: oneshot::Receiver<Result<String>>) -> Result<String> {
    let result = match rx.await {
        Ok(result) => result,
        Err(_) => {
            warn!(session = %caller.session_key, "Dispatch ended without a result");
            Err(Error::RequestLost)
        }
    };
    if matches!(result, Err(Error::QueueCleared)) {
        caller.notify(&format!("❌ {}", Error::QueueCleared)).await;
    }
    result
}

#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                dispatcher,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Admit a request and wait for its result.
    ///
    /// # Errors
    ///
    /// - `QueueFull` when the request would have to wait and the queue is at capacity
    /// - `QueueCleared` when [`clear`](Self::clear) rejected the waiting request
    /// - `RequestLost` when its dispatch ended without producing a result
    /// - anything the dispatched run fails with
    pub async fn submit(&self, request: RelayRequest) -> Result<String> {
        let caller = request.clone();
        let admission = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let max_size = self.inner.config.max_queue_size;
            let busy = state.running.contains(&caller.session_key);
            if !busy && state.in_flight < self.inner.config.max_concurrent {
                state.take_slot(&caller.session_key);
                Admission::Run(InFlightGuard {
                    inner: Arc::clone(&self.inner),
                    session_key: caller.session_key.clone(),
                })
            } else if state.waiting() >= max_size {
                Admission::Full {
                    current: state.waiting(),
                    max: max_size,
                }
            } else {
                let (tx, rx) = oneshot::channel();
                let entry = QueueEntry {
                    request,
                    enqueued_at: Instant::now(),
                    respond: tx,
                };
                if busy {
                    state.park(entry);
                    Admission::Pending {
                        rx,
                        interrupted: self.inner.dispatcher.session_busy(&caller),
                    }
                } else {
                    state.queue.push_back(entry);
                    Admission::Queued {
                        rx,
                        position: state.queue.len(),
                        in_flight: state.in_flight,
                    }
                }
            }
        };

        match admission {
            Admission::Run(guard) => {
                debug!(session = %caller.session_key, "Dispatching immediately");
                let result = self.inner.dispatcher.dispatch(caller).await;
                drop(guard);
                result
            }
            Admission::Full { current, max } => {
                let err = Error::QueueFull { current, max };
                warn!(session = %caller.session_key, queue_len = current, "Rejecting request: {}", err);
                caller.notify(&format!("❌ {}", err)).await;
                Err(err)
            }
            Admission::Queued {
                rx,
                position,
                in_flight,
            } => {
                info!(
                    session = %caller.session_key,
                    requester = %caller.requester,
                    position,
                    in_flight,
                    "Request queued"
                );
                caller
                    .notify(&format!(
                        "⏳ Queued at position {} ({} running)",
                        position, in_flight
                    ))
                    .await;
                wait_for(&caller, rx).await
            }
            Admission::Pending { rx, interrupted } => {
                info!(
                    session = %caller.session_key,
                    requester = %caller.requester,
                    interrupted,
                    "Request waits for the session's active run"
                );
                if !interrupted {
                    caller
                        .notify("⏳ Waiting for the current run in this conversation to finish")
                        .await;
                }
                wait_for(&caller, rx).await
            }
        }
    }

    /// Reject every waiting request. In-flight runs are untouched.
    pub fn clear(&self) -> usize {
        let entries: Vec<QueueEntry> = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let mut entries: Vec<QueueEntry> = state.queue.drain(..).collect();
            for (_, pending) in state.pending.drain() {
                entries.extend(pending);
            }
            entries
        };
        let count = entries.len();
        for entry in entries {
            let _ = entry.respond.send(Err(Error::QueueCleared));
        }
        if count > 0 {
            info!(cleared = count, "Queue cleared");
        }
        count
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.inner.lock();
        QueueStatus {
            queued: state.queue.len(),
            pending: state.pending.values().map(VecDeque::len).sum(),
            max_size: self.inner.config.max_queue_size,
            oldest_wait: state
                .queue
                .iter()
                .chain(state.pending.values().flatten())
                .map(|e| e.enqueued_at)
                .min()
                .map(|at| at.elapsed()),
            in_flight: state.in_flight,
            max_concurrent: self.inner.config.max_concurrent,
        }
    }
}
