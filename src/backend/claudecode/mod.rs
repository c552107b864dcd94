pub mod client;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::shared::{CliEvent, CliTranslator};
use crate::backend::{cancellable, Backend, EventStream, ProviderError, QueryRequest};
use crate::util::safe_truncate_index;

use client::{ClaudeCodeClient, ClaudeCodeConfig, CliProcess};

/// How long the CLI gets to exit after its final `result` line.
const EXIT_GRACE: Duration = Duration::from_secs(10);

/// Claude Code backend that spawns the Claude CLI per query.
pub struct ClaudeCodeBackend {
    id: String,
    name: String,
    config: ClaudeCodeConfig,
}

impl ClaudeCodeBackend {
    pub fn new() -> Self {
        Self::with_config(ClaudeCodeConfig::default())
    }

    pub fn with_config(config: ClaudeCodeConfig) -> Self {
        Self {
            id: "claudecode".to_string(),
            name: "Claude Code".to_string(),
            config,
        }
    }
}

impl Default for ClaudeCodeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for ClaudeCodeBackend {
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
        let client = ClaudeCodeClient::with_config(self.config.clone());
        let process = client
            .spawn(&request.prompt, &request.options)
            .await
            .map_err(|e| ProviderError::failed(e.to_string()))?;
        Ok(cancellable(cli_event_stream(process), request.cancel))
    }
}

fn excerpt(line: &str) -> String {
    if line.len() > 200 {
        let end = safe_truncate_index(line, 200);
        format!("{}...", &line[..end])
    } else {
        line.to_string()
    }
}

/// Turn a spawned CLI into a normalized event stream.
///
/// A non-zero exit before the `result` line is reported as a crash with the
/// exit code and the stderr tail; dropping the stream kills the process.
fn cli_event_stream(process: CliProcess) -> EventStream {
    Box::pin(async_stream::stream! {
        let CliProcess { mut child, mut lines, stdin, stderr_tail } = process;
        let mut translator = CliTranslator::new();
        let mut saw_result = false;

        loop {
            let raw = match lines.next_line().await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read Claude stdout: {}", e);
                    break;
                }
            };
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if !line.starts_with('{') {
                debug!("Non-JSON Claude output: {}", excerpt(line));
                continue;
            }

            match serde_json::from_str::<CliEvent>(line) {
                Ok(event) => {
                    if matches!(event, CliEvent::Result(_)) {
                        saw_result = true;
                    }
                    for normalized in translator.translate(event) {
                        yield Ok(normalized);
                    }
                }
                Err(e) => {
                    warn!("Failed to parse Claude event: {} - line: {}", e, excerpt(line));
                }
            }

            if saw_result {
                break;
            }
        }

        drop(stdin);
        let status = match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("Claude CLI did not exit after its result, killing it");
                let _ = child.kill().await;
                child.wait().await
            }
        };
        let stderr = tokio::time::timeout(Duration::from_secs(1), stderr_tail)
            .await
            .ok()
            .and_then(|joined| joined.ok())
            .unwrap_or_default();

        match status {
            Ok(status) if status.success() => {
                debug!("Claude CLI exited successfully");
                if !saw_result {
                    yield Err(ProviderError::failed("Claude CLI exited without a result"));
                }
            }
            Ok(status) => {
                if saw_result {
                    warn!("Claude CLI exited with status {} after its result", status);
                } else {
                    let mut message = format!("Claude CLI exited with status {}", status);
                    if !stderr.is_empty() {
                        message.push_str(": ");
                        message.push_str(&stderr);
                    }
                    yield Err(ProviderError::crashed(message, status.code()));
                }
            }
            Err(e) => {
                yield Err(ProviderError::crashed(
                    format!("Failed to wait for Claude CLI: {}", e),
                    None,
                ));
            }
        }
    })
}

/// Create a registry entry for the Claude Code backend.
pub fn registry_entry(config: ClaudeCodeConfig) -> Arc<dyn Backend> {
    Arc::new(ClaudeCodeBackend::with_config(config))
}
