use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backend::QueryOptions;

/// Number of stderr lines kept for crash diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Configuration for the Claude Code client.
#[derive(Debug, Clone)]
pub struct ClaudeCodeConfig {
    pub cli_path: String,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            cli_path: std::env::var("CLAUDE_CLI_PATH").unwrap_or_else(|_| "claude".to_string()),
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            default_model: None,
        }
    }
}

/// A spawned CLI process with its stdout line reader.
///
/// The child is spawned with `kill_on_drop`, so dropping the process (for
/// instance when a cancelled event stream is dropped) terminates the CLI.
pub struct CliProcess {
    pub child: Child,
    pub lines: Lines<BufReader<ChildStdout>>,
    /// Kept open so the CLI stays alive while tools run.
    pub stdin: Option<ChildStdin>,
    /// Resolves to the last stderr lines once the process closes stderr.
    pub stderr_tail: JoinHandle<String>,
}

/// Client for spawning the Claude CLI.
pub struct ClaudeCodeClient {
    config: ClaudeCodeConfig,
}

impl ClaudeCodeClient {
    pub fn new() -> Self {
        Self {
            config: ClaudeCodeConfig::default(),
        }
    }

    pub fn with_config(config: ClaudeCodeConfig) -> Self {
        Self { config }
    }

    /// Build the CLI invocation for one query.
    pub fn build_command(&self, options: &QueryOptions) -> Command {
        let mut cmd = Command::new(&self.config.cli_path);
        cmd.current_dir(&options.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages");

        // OAuth tokens start with "sk-ant-oat" and must use CLAUDE_CODE_OAUTH_TOKEN
        if let Some(ref key) = self.config.api_key {
            if key.starts_with("sk-ant-oat") {
                cmd.env("CLAUDE_CODE_OAUTH_TOKEN", key);
            } else {
                cmd.env("ANTHROPIC_API_KEY", key);
            }
        }

        if options.max_thinking_tokens > 0 {
            cmd.env("MAX_THINKING_TOKENS", options.max_thinking_tokens.to_string());
        }

        // Claude Code expects bare model IDs, not provider-prefixed ones.
        let effective_model = options
            .model
            .as_deref()
            .or(self.config.default_model.as_deref());
        if let Some(m) = effective_model {
            let bare = m.strip_prefix("anthropic/").unwrap_or(m);
            cmd.arg("--model").arg(bare);
        }

        if let Some(ref session_id) = options.resume {
            cmd.arg("--resume").arg(session_id);
        }

        cmd
    }

    /// Spawn the CLI for `prompt` and hand back its stdout reader.
    pub async fn spawn(&self, prompt: &str, options: &QueryOptions) -> Result<CliProcess> {
        let mut cmd = self.build_command(options);

        info!(
            "Spawning Claude CLI: directory={}, resume={:?}, thinking_tokens={}",
            options.working_dir.display(),
            options.resume,
            options.max_thinking_tokens
        );

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn Claude CLI: {}", e);
            anyhow!(
                "Failed to spawn Claude CLI: {}. Is it installed at '{}'?",
                e,
                self.config.cli_path
            )
        })?;

        let stdin = match child.stdin.take() {
            Some(mut stdin) => {
                stdin
                    .write_all(prompt.as_bytes())
                    .await
                    .map_err(|e| anyhow!("Failed to write prompt to Claude stdin: {}", e))?;
                Some(stdin)
            }
            None => None,
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture Claude stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Failed to capture Claude stderr"))?;

        // Drain stderr so the CLI never blocks on a full pipe.
        let stderr_tail = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("Claude stderr: {}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        Ok(CliProcess {
            child,
            lines: BufReader::new(stdout).lines(),
            stdin,
            stderr_tail,
        })
    }
}

impl Default for ClaudeCodeClient {
    fn default() -> Self {
        Self::new()
    }
}
