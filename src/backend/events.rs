use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Backend-agnostic events. Every provider translates its wire format into
/// this closed set; order within one stream is significant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    /// Backend run started; carries the resumable backend session id.
    Started { backend_session_id: String },
    /// Agent is thinking/reasoning.
    ThinkingDelta { text: String },
    /// Agent is invoking a tool.
    ToolInvocation { name: String, input: Value },
    /// Text content being streamed.
    TextDelta { text: String },
    /// Run completed.
    Completed { usage: Usage },
    /// Backend reported an error.
    Error { message: String },
}

/// Token usage (and cost, when the backend reports it) for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Uncached input tokens
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    /// Cost reported by the backend, or computed from model pricing
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

impl Usage {
    /// Check if there's any usage to compute cost from.
    pub fn has_usage(&self) -> bool {
        self.input_tokens > 0 || self.output_tokens > 0
    }
}
