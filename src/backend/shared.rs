//! NDJSON wire types of the Claude CLI in `stream-json` mode and their
//! translation into [`NormalizedEvent`]s.
//!
//! Unknown event, stream-event and content-block kinds deserialize into an
//! `Unknown` variant and are dropped by the translator, so newer CLI versions
//! never break a run.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::events::{NormalizedEvent, Usage};

// ── NDJSON event types ────────────────────────────────────────────

/// Events emitted by the Claude CLI in stream-json mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CliEvent {
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "stream_event")]
    StreamEvent(StreamEventWrapper),
    #[serde(rename = "assistant")]
    Assistant(AssistantEvent),
    #[serde(rename = "user")]
    User(UserEvent),
    #[serde(rename = "result")]
    Result(ResultEvent),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamEventWrapper {
    pub event: StreamEvent,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart {
        #[serde(default)]
        message: Value,
    },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: u32,
        content_block: ContentBlockInfo,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u32, delta: Delta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u32 },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        delta: Value,
        #[serde(default)]
        usage: Option<Value>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlockInfo {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Delta {
    #[serde(rename = "type")]
    pub delta_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub partial_json: Option<String>,
    /// Thinking content for thinking_delta events (extended thinking).
    #[serde(default)]
    pub thinking: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantMessage,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
}

impl WireUsage {
    pub fn into_usage(self, cost_usd: Option<f64>) -> Usage {
        Usage {
            input_tokens: self.input_tokens.unwrap_or(0),
            output_tokens: self.output_tokens.unwrap_or(0),
            cache_creation_input_tokens: self.cache_creation_input_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens,
            cost_usd,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEvent {
    pub message: UserMessage,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Claude Code puts errors in an array field.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResultEvent {
    /// Extract the best available error/result message.
    /// Checks `result`, `error`, `message` and then `errors`, parsing
    /// embedded JSON error payloads (e.g. `402 {"type":"error",...}`).
    pub fn error_message(&self) -> String {
        let from_errors = self
            .errors
            .first()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_str());

        let raw = self
            .result
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.error.as_deref().filter(|s| !s.is_empty()))
            .or(self.message.as_deref().filter(|s| !s.is_empty()))
            .or(from_errors)
            .unwrap_or("Unknown error");

        Self::parse_error_json(raw).unwrap_or_else(|| raw.to_string())
    }

    /// Whether the result reports a failure, either through its flags or
    /// through an API error payload in the result text.
    pub fn is_failure(&self) -> bool {
        let result_text = self.result.as_deref().unwrap_or("");
        let looks_like_api_error = result_text.starts_with("API Error:")
            || result_text.contains("\"type\":\"error\"")
            || result_text.contains("\"type\":\"overloaded_error\"")
            || result_text.contains("\"type\":\"api_error\"");
        self.is_error || self.subtype.starts_with("error") || looks_like_api_error
    }

    fn parse_error_json(raw: &str) -> Option<String> {
        let json_str = raw.find('{').map(|idx| &raw[idx..]).unwrap_or(raw);
        let parsed: Value = serde_json::from_str(json_str).ok()?;
        parsed
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .or_else(|| parsed.get("message").and_then(|m| m.as_str()))
            .map(|s| s.to_string())
    }
}

// ── Event conversion ──────────────────────────────────────────────

/// Stateful translator from CLI events to normalized events.
///
/// With `--include-partial-messages` the CLI streams text and thinking as
/// deltas and then repeats the complete blocks in the `assistant` event; the
/// complete blocks are only used when no deltas were seen for the message.
#[derive(Debug, Default)]
pub struct CliTranslator {
    pending_tools: HashMap<String, String>,
    streamed_text: bool,
    streamed_thinking: bool,
    started: bool,
}

impl CliTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: CliEvent) -> Vec<NormalizedEvent> {
        let mut results = vec![];

        match event {
            CliEvent::System(sys) => {
                debug!(
                    "CLI session initialized: session_id={:?}, model={:?}",
                    sys.session_id, sys.model
                );
                if sys.subtype == "init" && !self.started {
                    if let Some(session_id) = sys.session_id {
                        self.started = true;
                        results.push(NormalizedEvent::Started {
                            backend_session_id: session_id,
                        });
                    }
                }
            }

            CliEvent::StreamEvent(wrapper) => match wrapper.event {
                StreamEvent::MessageStart { .. } => {
                    self.streamed_text = false;
                    self.streamed_thinking = false;
                }
                StreamEvent::ContentBlockDelta { delta, .. } => {
                    if let Some(text) = delta.text {
                        if !text.is_empty() {
                            self.streamed_text = true;
                            results.push(NormalizedEvent::TextDelta { text });
                        }
                    }
                    if let Some(thinking) = delta.thinking {
                        if !thinking.is_empty() {
                            self.streamed_thinking = true;
                            results.push(NormalizedEvent::ThinkingDelta { text: thinking });
                        }
                    }
                    if let Some(partial) = delta.partial_json {
                        debug!("Tool input delta: {}", partial);
                    }
                }
                StreamEvent::ContentBlockStart { content_block, .. } => {
                    if content_block.block_type == "tool_use" {
                        if let (Some(id), Some(name)) = (content_block.id, content_block.name) {
                            self.pending_tools.insert(id, name);
                        }
                    }
                }
                StreamEvent::Unknown => debug!("Ignoring unknown CLI stream event"),
                _ => {}
            },

            CliEvent::Assistant(evt) => {
                for block in evt.message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if !text.is_empty() && !self.streamed_text {
                                results.push(NormalizedEvent::TextDelta { text });
                            }
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            self.pending_tools.insert(id, name.clone());
                            results.push(NormalizedEvent::ToolInvocation { name, input });
                        }
                        ContentBlock::Thinking { thinking } => {
                            if !thinking.is_empty() && !self.streamed_thinking {
                                results.push(NormalizedEvent::ThinkingDelta { text: thinking });
                            }
                        }
                        ContentBlock::ToolResult { .. } | ContentBlock::Unknown => {}
                    }
                }
            }

            CliEvent::User(evt) => {
                for block in evt.message.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        is_error,
                        ..
                    } = block
                    {
                        let name = self
                            .pending_tools
                            .remove(&tool_use_id)
                            .unwrap_or_else(|| "unknown".to_string());
                        debug!(tool = %name, is_error, "Tool result received");
                    }
                }
            }

            CliEvent::Result(res) => {
                if res.is_failure() {
                    results.push(NormalizedEvent::Error {
                        message: res.error_message(),
                    });
                } else {
                    debug!(
                        "CLI result: subtype={}, cost={:?}, duration={:?}ms, turns={:?}",
                        res.subtype, res.total_cost_usd, res.duration_ms, res.num_turns
                    );
                    let usage = res
                        .usage
                        .unwrap_or_default()
                        .into_usage(res.total_cost_usd);
                    results.push(NormalizedEvent::Completed { usage });
                }
            }

            CliEvent::Unknown => debug!("Ignoring unknown CLI event type"),
        }

        results
    }
}
