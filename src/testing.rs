//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::{
    cancellable, Backend, EventStream, NormalizedEvent, ProviderError, QueryOptions,
    QueryRequest, Usage,
};
use crate::delivery::{ChatTransport, MessageHandle, TransportError};

/// One step of a scripted backend run.
#[derive(Debug, Clone)]
pub enum Step {
    Event(NormalizedEvent),
    /// Terminal stream error.
    Fail(ProviderError),
    Sleep(Duration),
    /// Block until the query is cancelled.
    Hang,
}

pub fn started(id: &str) -> Step {
    Step::Event(NormalizedEvent::Started {
        backend_session_id: id.to_string(),
    })
}

pub fn text(t: &str) -> Step {
    Step::Event(NormalizedEvent::TextDelta {
        text: t.to_string(),
    })
}

pub fn tool(name: &str, input: Value) -> Step {
    Step::Event(NormalizedEvent::ToolInvocation {
        name: name.to_string(),
        input,
    })
}

pub fn completed() -> Step {
    Step::Event(NormalizedEvent::Completed {
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        },
    })
}

pub fn crash(message: &str) -> Step {
    Step::Fail(ProviderError::crashed(message, Some(1)))
}

/// Backend that replays one script per query, in order.
pub struct ScriptedBackend {
    id: String,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<QueryOptions>>,
}

impl ScriptedBackend {
    pub fn new(id: &str, scripts: Vec<Vec<Step>>) -> Self {
        Self {
            id: id.to_string(),
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Options of every query received so far.
    pub fn requests(&self) -> Vec<QueryOptions> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    async fn create_query(&self, request: QueryRequest) -> Result<EventStream, ProviderError> {
        self.requests.lock().unwrap().push(request.options.clone());
        if request.cancel.is_cancelled() {
            return Err(ProviderError::cancelled());
        }
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::failed("no script left"))?;

        let stream: EventStream = Box::pin(async_stream::stream! {
            for step in steps {
                match step {
                    Step::Event(event) => yield Ok(event),
                    Step::Fail(err) => {
                        yield Err(err);
                        break;
                    }
                    Step::Sleep(d) => tokio::time::sleep(d).await,
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        });
        Ok(cancellable(stream, request.cancel))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Create { id: String, text: String },
    Edit { id: String, text: String },
    Delete { id: String },
}

/// Transport that records every successful call in order.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
    next_id: Mutex<u64>,
    fail_creates: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Create { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Edit { id, text } => Some((id, text)),
                _ => None,
            })
            .collect()
    }

    /// Current text of every message not deleted, in creation order.
    pub fn visible(&self) -> Vec<String> {
        let mut messages: Vec<(String, String)> = Vec::new();
        for call in self.calls() {
            match call {
                TransportCall::Create { id, text } => messages.push((id, text)),
                TransportCall::Edit { id, text } => {
                    if let Some(entry) = messages.iter_mut().find(|(m, _)| *m == id) {
                        entry.1 = text;
                    }
                }
                TransportCall::Delete { id } => messages.retain(|(m, _)| *m != id),
            }
        }
        messages.into_iter().map(|(_, text)| text).collect()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn create_message(&self, text: &str) -> Result<MessageHandle, TransportError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(TransportError::Failed("create refused".to_string()));
        }
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("m{}", *next)
        };
        self.calls.lock().unwrap().push(TransportCall::Create {
            id: id.clone(),
            text: text.to_string(),
        });
        Ok(MessageHandle(id))
    }

    async fn edit_message(
        &self,
        handle: &MessageHandle,
        text: &str,
    ) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(TransportCall::Edit {
            id: handle.0.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, handle: &MessageHandle) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(TransportCall::Delete {
            id: handle.0.clone(),
        });
        Ok(())
    }
}

/// Yield to other tasks until `cond` holds, failing the test after a while.
pub async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
