//! Configuration management for the relay.
//!
//! Configuration is read from environment variables:
//! - `MAX_CONCURRENT` - Optional. Backend runs allowed at once. Defaults to `3`.
//! - `MAX_QUEUE_SIZE` - Optional. Requests allowed to wait for a slot. Defaults to `10`.
//! - `EDIT_THROTTLE_MS` - Optional. Minimum gap between edits of one message. Defaults to `500`.
//! - `MESSAGE_LIMIT` - Optional. Chat surface message length limit. Defaults to `4096`.
//! - `MESSAGE_FORMAT` - Optional. `plain` or `html`. Defaults to `plain`.
//! - `STALE_RUN_TIMEOUT_SECS` - Optional. Wall-clock cap for one run; unset or `0` disables it.
//! - `WORKING_DIR` - Optional. Directory backends run in. Defaults to the current directory.
//! - `DEFAULT_BACKEND` - Optional. `claudecode` or `anthropic`. Defaults to `claudecode`.
//! - `CLAUDE_CLI_PATH` - Optional. Path to the Claude CLI. Defaults to `claude`.
//! - `ANTHROPIC_API_KEY` - Required when the default backend is `anthropic`.
//! - `ANTHROPIC_BASE_URL` - Optional. Messages API base URL.
//! - `DEFAULT_MODEL` - Optional. Model passed to backends.
//! - `SESSION_STORE_PATH` - Optional. JSON file for backend session ids; in-memory when unset.
//! - `THINKING_KEYWORDS` / `THINKING_DEEP_KEYWORDS` - Optional. Comma-separated trigger words.
//! - `BLOCKED_PATTERNS` - Optional. Extra comma-separated command patterns to refuse.
//! - `ALLOWED_PATHS` - Optional. Comma-separated roots file tools may touch.
//! - `INTERRUPT_ON_NEW_MESSAGE` - Optional. Stop a busy session on a new message. Defaults to `true`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::delivery::MessageFormat;
use crate::util::{parse_bool, split_list};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub edit_throttle: Duration,
    pub message_limit: usize,
    pub message_format: MessageFormat,
    /// `None` disables the stale-run timeout.
    pub stale_run_timeout: Option<Duration>,
    pub working_dir: PathBuf,
    pub default_backend: String,
    pub claude_cli_path: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub default_model: Option<String>,
    /// `None` keeps backend session ids in memory only.
    pub session_store_path: Option<PathBuf>,
    /// `None` means the built-in keyword lists.
    pub thinking_keywords: Option<Vec<String>>,
    pub thinking_deep_keywords: Option<Vec<String>>,
    pub blocked_patterns: Vec<String>,
    pub allowed_paths: Vec<PathBuf>,
    pub interrupt_on_new_message: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_size: 10,
            edit_throttle: Duration::from_millis(500),
            message_limit: 4096,
            message_format: MessageFormat::Plain,
            stale_run_timeout: None,
            working_dir: PathBuf::from("."),
            default_backend: "claudecode".to_string(),
            claude_cli_path: "claude".to_string(),
            anthropic_api_key: None,
            anthropic_base_url: None,
            default_model: None,
            session_store_path: None,
            thinking_keywords: None,
            thinking_deep_keywords: None,
            blocked_patterns: Vec::new(),
            allowed_paths: Vec::new(),
            interrupt_on_new_message: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparseable numbers or a zero
    /// concurrency cap, and `ConfigError::MissingEnvVar` when the Anthropic
    /// backend is the default but no API key is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let max_concurrent = parse_or(&var, "MAX_CONCURRENT", defaults.max_concurrent)?;
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_CONCURRENT".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let max_queue_size = parse_or(&var, "MAX_QUEUE_SIZE", defaults.max_queue_size)?;
        let edit_throttle = Duration::from_millis(parse_or(
            &var,
            "EDIT_THROTTLE_MS",
            defaults.edit_throttle.as_millis() as u64,
        )?);
        let message_limit = parse_or(&var, "MESSAGE_LIMIT", defaults.message_limit)?;
        let message_format = parse_or(&var, "MESSAGE_FORMAT", defaults.message_format)?;
        let stale_secs: u64 = parse_or(&var, "STALE_RUN_TIMEOUT_SECS", 0)?;
        let stale_run_timeout = (stale_secs > 0).then(|| Duration::from_secs(stale_secs));

        let working_dir = var("WORKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let default_backend = var("DEFAULT_BACKEND").unwrap_or(defaults.default_backend);
        let anthropic_api_key = var("ANTHROPIC_API_KEY");
        if default_backend == "anthropic" && anthropic_api_key.is_none() {
            return Err(ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()));
        }

        Ok(Self {
            max_concurrent,
            max_queue_size,
            edit_throttle,
            message_limit,
            message_format,
            stale_run_timeout,
            working_dir,
            default_backend,
            claude_cli_path: var("CLAUDE_CLI_PATH").unwrap_or(defaults.claude_cli_path),
            anthropic_api_key,
            anthropic_base_url: var("ANTHROPIC_BASE_URL"),
            default_model: var("DEFAULT_MODEL"),
            session_store_path: var("SESSION_STORE_PATH").map(PathBuf::from),
            thinking_keywords: var("THINKING_KEYWORDS").map(|v| split_list(&v)),
            thinking_deep_keywords: var("THINKING_DEEP_KEYWORDS").map(|v| split_list(&v)),
            blocked_patterns: var("BLOCKED_PATTERNS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            allowed_paths: var("ALLOWED_PATHS")
                .map(|v| split_list(&v).into_iter().map(PathBuf::from).collect())
                .unwrap_or_default(),
            interrupt_on_new_message: var("INTERRUPT_ON_NEW_MESSAGE")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.interrupt_on_new_message),
        })
    }
}

fn parse_or<T, F>(var: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.max_queue_size, 10);
        assert_eq!(config.edit_throttle, Duration::from_millis(500));
        assert_eq!(config.stale_run_timeout, None);
        assert_eq!(config.default_backend, "claudecode");
        assert!(config.interrupt_on_new_message);
        assert!(config.thinking_keywords.is_none());
        assert_eq!(config.message_format, MessageFormat::Plain);
    }

    #[test]
    fn message_format_is_selectable() {
        let config = config_from(&[("MESSAGE_FORMAT", "HTML")]).unwrap();
        assert_eq!(config.message_format, MessageFormat::Html);
        assert!(matches!(
            config_from(&[("MESSAGE_FORMAT", "rtf")]),
            Err(ConfigError::InvalidValue(name, _)) if name == "MESSAGE_FORMAT"
        ));
    }

    #[test]
    fn values_are_parsed() {
        let config = config_from(&[
            ("MAX_CONCURRENT", "2"),
            ("MAX_QUEUE_SIZE", "3"),
            ("STALE_RUN_TIMEOUT_SECS", "600"),
            ("ALLOWED_PATHS", "/srv/a, /srv/b"),
            ("THINKING_KEYWORDS", "think,ponder"),
            ("INTERRUPT_ON_NEW_MESSAGE", "off"),
        ])
        .unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.max_queue_size, 3);
        assert_eq!(config.stale_run_timeout, Some(Duration::from_secs(600)));
        assert_eq!(
            config.allowed_paths,
            vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]
        );
        assert_eq!(
            config.thinking_keywords,
            Some(vec!["think".to_string(), "ponder".to_string()])
        );
        assert!(!config.interrupt_on_new_message);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        match config_from(&[("MAX_QUEUE_SIZE", "lots")]) {
            Err(ConfigError::InvalidValue(name, _)) => assert_eq!(name, "MAX_QUEUE_SIZE"),
            other => panic!("Expected invalid value, got {:?}", other),
        }
        assert!(matches!(
            config_from(&[("MAX_CONCURRENT", "0")]),
            Err(ConfigError::InvalidValue(_, _))
        ));
    }

    #[test]
    fn anthropic_default_requires_api_key() {
        assert!(matches!(
            config_from(&[("DEFAULT_BACKEND", "anthropic")]),
            Err(ConfigError::MissingEnvVar(_))
        ));
        let config = config_from(&[
            ("DEFAULT_BACKEND", "anthropic"),
            ("ANTHROPIC_API_KEY", "sk-test"),
        ])
        .unwrap();
        assert_eq!(config.anthropic_api_key.as_deref(), Some("sk-test"));
    }
}
