//! In-process backend that talks to the Anthropic Messages API directly.
//!
//! The API itself is stateless, so this backend owns the conversation
//! history. A backend session id is a key into that history; resuming with
//! an id the backend no longer knows (for instance after a restart) starts a
//! fresh conversation under a new id.

pub mod client;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::error::classify_http_status;
use crate::backend::shared::{StreamEvent, WireUsage};
use crate::backend::{
    cancellable, Backend, EventStream, NormalizedEvent, ProviderError, QueryRequest,
};

use client::{AnthropicClient, AnthropicConfig, ApiErrorEvent, ApiMessage};

type Conversations = Arc<Mutex<HashMap<String, Vec<ApiMessage>>>>;

pub struct AnthropicBackend {
    id: String,
    name: String,
    client: AnthropicClient,
    conversations: Conversations,
}

impl AnthropicBackend {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            id: "anthropic".to_string(),
            name: "Anthropic API".to_string(),
            client: AnthropicClient::new(config),
            conversations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Look up the history to continue, allocating a new id when there is none.
    fn conversation_for(&self, resume: Option<&str>) -> (String, Vec<ApiMessage>) {
        let conversations = self
            .conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(id) = resume {
            if let Some(history) = conversations.get(id) {
                return (id.to_string(), history.clone());
            }
            warn!(handle = %id, "Unknown Anthropic conversation, starting fresh");
        }
        (Uuid::new_v4().to_string(), Vec::new())
    }

    pub fn history_len(&self, id: &str) -> usize {
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn create_query(&self, request: QueryRequest) -> Result<EventStream, ProviderError> {
        if request.cancel.is_cancelled() {
            return Err(ProviderError::cancelled());
        }
        let (handle, mut messages) = self.conversation_for(request.options.resume.as_deref());
        messages.push(ApiMessage::user(request.prompt.clone()));

        let body = self.client.request_body(
            &messages,
            request.options.model.as_deref(),
            request.options.max_thinking_tokens,
        );
        let source = self.client.open_stream(&body)?;
        debug!(handle = %handle, turns = messages.len(), "Opened Anthropic event stream");

        let stream = api_event_stream(source, handle, messages, Arc::clone(&self.conversations));
        Ok(cancellable(stream, request.cancel))
    }
}

fn api_event_stream(
    mut source: EventSource,
    handle: String,
    messages: Vec<ApiMessage>,
    conversations: Conversations,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut translator = ApiTranslator::new(handle.clone());
        let mut failure: Option<ProviderError> = None;

        while let Some(event) = source.next().await {
            match event {
                Ok(SseEvent::Open) => debug!("Anthropic event stream open"),
                Ok(SseEvent::Message(message)) => {
                    if message.event == "error" {
                        failure = Some(match serde_json::from_str::<ApiErrorEvent>(&message.data) {
                            Ok(err) if err.is_crash() => ProviderError::crashed(err.error.message, None),
                            Ok(err) => ProviderError::failed(err.error.message),
                            Err(_) => ProviderError::failed(message.data.clone()),
                        });
                        break;
                    }
                    let events = match serde_json::from_str::<StreamEvent>(&message.data) {
                        Ok(parsed) => translator.translate(parsed),
                        Err(e) => {
                            warn!("Failed to parse Anthropic event {}: {}", message.event, e);
                            Vec::new()
                        }
                    };
                    if translator.is_finished() {
                        let mut turn = messages.clone();
                        turn.push(ApiMessage::assistant(translator.text()));
                        conversations
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .insert(handle.clone(), turn);
                    }
                    for normalized in events {
                        yield Ok(normalized);
                    }
                    if translator.is_finished() {
                        break;
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    let body = response.text().await.unwrap_or_default();
                    failure = Some(ProviderError {
                        kind: classify_http_status(status.as_u16()),
                        message: format!("HTTP {}: {}", status, body),
                        exit_code: None,
                    });
                    break;
                }
                Err(reqwest_eventsource::Error::Transport(e)) => {
                    failure = Some(ProviderError::crashed(format!("Connection dropped: {}", e), None));
                    break;
                }
                Err(e) => {
                    failure = Some(ProviderError::failed(e.to_string()));
                    break;
                }
            }
        }
        source.close();

        if let Some(err) = failure {
            yield Err(err);
        } else if !translator.is_finished() {
            yield Err(ProviderError::crashed("Event stream ended before message_stop", None));
        }
    })
}

#[derive(Debug)]
struct ToolBlock {
    name: String,
    input_json: String,
}

/// Translates Messages API stream events into normalized events.
#[derive(Debug)]
pub struct ApiTranslator {
    handle: String,
    started: bool,
    finished: bool,
    tool_blocks: HashMap<u32, ToolBlock>,
    text: String,
    usage: WireUsage,
}

impl ApiTranslator {
    pub fn new(handle: String) -> Self {
        Self {
            handle,
            started: false,
            finished: false,
            tool_blocks: HashMap::new(),
            text: String::new(),
            usage: WireUsage::default(),
        }
    }

    /// Assistant text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn translate(&mut self, event: StreamEvent) -> Vec<NormalizedEvent> {
        let mut results = vec![];

        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message
                    .get("usage")
                    .and_then(|u| serde_json::from_value::<WireUsage>(u.clone()).ok())
                {
                    self.usage = usage;
                }
                if !self.started {
                    self.started = true;
                    results.push(NormalizedEvent::Started {
                        backend_session_id: self.handle.clone(),
                    });
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if content_block.block_type == "tool_use" {
                    self.tool_blocks.insert(
                        index,
                        ToolBlock {
                            name: content_block.name.unwrap_or_else(|| "unknown".to_string()),
                            input_json: String::new(),
                        },
                    );
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                if let Some(text) = delta.text {
                    if !text.is_empty() {
                        self.text.push_str(&text);
                        results.push(NormalizedEvent::TextDelta { text });
                    }
                }
                if let Some(thinking) = delta.thinking {
                    if !thinking.is_empty() {
                        results.push(NormalizedEvent::ThinkingDelta { text: thinking });
                    }
                }
                if let Some(partial) = delta.partial_json {
                    if let Some(block) = self.tool_blocks.get_mut(&index) {
                        block.input_json.push_str(&partial);
                    }
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                if let Some(block) = self.tool_blocks.remove(&index) {
                    let input = if block.input_json.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&block.input_json).unwrap_or_else(|e| {
                            warn!(tool = %block.name, "Unparseable tool input: {}", e);
                            Value::String(block.input_json.clone())
                        })
                    };
                    results.push(NormalizedEvent::ToolInvocation {
                        name: block.name,
                        input,
                    });
                }
            }
            StreamEvent::MessageDelta { usage, .. } => {
                if let Some(output) = usage
                    .as_ref()
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                {
                    self.usage.output_tokens = Some(output);
                }
            }
            StreamEvent::MessageStop => {
                self.finished = true;
                results.push(NormalizedEvent::Completed {
                    usage: self.usage.clone().into_usage(None),
                });
            }
            StreamEvent::Unknown => debug!("Ignoring unknown Anthropic stream event"),
        }

        results
    }
}

/// Create a registry entry for the Anthropic API backend.
pub fn registry_entry(config: AnthropicConfig) -> Arc<dyn Backend> {
    Arc::new(AnthropicBackend::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{QueryOptions, Usage};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn feed(translator: &mut ApiTranslator, value: Value) -> Vec<NormalizedEvent> {
        translator.translate(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_full_message_translation() {
        let mut t = ApiTranslator::new("conv-1".to_string());
        let mut events = vec![];
        events.extend(feed(
            &mut t,
            json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 12, "output_tokens": 1}}}),
        ));
        events.extend(feed(
            &mut t,
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking"}}),
        ));
        events.extend(feed(
            &mut t,
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "hmm"}}),
        ));
        events.extend(feed(
            &mut t,
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "text_delta", "text": "Hello"}}),
        ));
        events.extend(feed(&mut t, json!({"type": "ping"})));
        events.extend(feed(
            &mut t,
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 42}}),
        ));
        events.extend(feed(&mut t, json!({"type": "message_stop"})));

        assert_eq!(
            events,
            vec![
                NormalizedEvent::Started {
                    backend_session_id: "conv-1".to_string()
                },
                NormalizedEvent::ThinkingDelta {
                    text: "hmm".to_string()
                },
                NormalizedEvent::TextDelta {
                    text: "Hello".to_string()
                },
                NormalizedEvent::Completed {
                    usage: Usage {
                        input_tokens: 12,
                        output_tokens: 42,
                        ..Default::default()
                    }
                },
            ]
        );
        assert!(t.is_finished());
        assert_eq!(t.text(), "Hello");
    }

    #[test]
    fn test_tool_input_is_assembled_from_partial_json() {
        let mut t = ApiTranslator::new("conv-1".to_string());
        feed(
            &mut t,
            json!({"type": "content_block_start", "index": 2, "content_block": {"type": "tool_use", "id": "tu_1", "name": "Bash"}}),
        );
        assert!(feed(
            &mut t,
            json!({"type": "content_block_delta", "index": 2, "delta": {"type": "input_json_delta", "partial_json": "{\"command\":"}}),
        )
        .is_empty());
        feed(
            &mut t,
            json!({"type": "content_block_delta", "index": 2, "delta": {"type": "input_json_delta", "partial_json": "\"ls -la\"}"}}),
        );
        let events = feed(&mut t, json!({"type": "content_block_stop", "index": 2}));
        assert_eq!(
            events,
            vec![NormalizedEvent::ToolInvocation {
                name: "Bash".to_string(),
                input: json!({"command": "ls -la"})
            }]
        );
    }

    #[test]
    fn test_unknown_resume_handle_starts_fresh() {
        let backend = AnthropicBackend::new(AnthropicConfig::default());
        let (id, history) = backend.conversation_for(Some("gone"));
        assert_ne!(id, "gone");
        assert!(history.is_empty());
        assert_eq!(backend.history_len("gone"), 0);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_reported_before_streaming() {
        let backend = AnthropicBackend::new(AnthropicConfig {
            api_key: None,
            ..AnthropicConfig::default()
        });
        let result = backend
            .create_query(QueryRequest {
                prompt: "hi".to_string(),
                options: QueryOptions::default(),
                cancel: CancellationToken::new(),
            })
            .await;
        match result {
            Err(e) => assert!(!e.is_crash()),
            Ok(_) => panic!("Expected configuration error"),
        }
    }
}
