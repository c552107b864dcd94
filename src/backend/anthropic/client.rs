use reqwest_eventsource::EventSource;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backend::ProviderError;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 8192;
/// Output room kept above the thinking budget.
const THINKING_HEADROOM: u32 = 4096;

/// Configuration for the Anthropic Messages API client.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub default_model: String,
    pub max_tokens: u32,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            base_url: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            default_model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// One turn of the conversation kept in-process for resumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: String,
    pub content: String,
}

impl ApiMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Streaming client for `/v1/messages`.
#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Build the JSON body for a streaming request.
    pub fn request_body(
        &self,
        messages: &[ApiMessage],
        model: Option<&str>,
        thinking_tokens: u32,
    ) -> Value {
        let model = model
            .map(|m| m.strip_prefix("anthropic/").unwrap_or(m))
            .unwrap_or(&self.config.default_model);
        let mut body = json!({
            "model": model,
            "max_tokens": self.config.max_tokens,
            "stream": true,
            "messages": messages,
        });
        if thinking_tokens > 0 {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": thinking_tokens,
            });
            body["max_tokens"] = json!(self
                .config
                .max_tokens
                .max(thinking_tokens + THINKING_HEADROOM));
        }
        body
    }

    /// Open the server-sent event stream for one request.
    pub fn open_stream(&self, body: &Value) -> Result<EventSource, ProviderError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::failed("ANTHROPIC_API_KEY is not configured"))?;
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let builder = self
            .http
            .post(url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body);
        EventSource::new(builder)
            .map_err(|e| ProviderError::failed(format!("Failed to open event stream: {}", e)))
    }
}

/// Payload of an SSE `error` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorEvent {
    pub error: ApiErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ApiErrorEvent {
    /// Overload and internal API errors leave nothing to resume from.
    pub fn is_crash(&self) -> bool {
        matches!(
            self.error.error_type.as_str(),
            "overloaded_error" | "api_error"
        )
    }
}
