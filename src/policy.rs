//! Injected policies consulted by the execution engine.
//!
//! [`SafetyPolicy`] is asked about every tool invocation before it reaches the
//! chat surface; [`ThinkingPolicy`] picks the extended-thinking budget for a
//! message.

use std::path::{Component, Path, PathBuf};

use serde_json::Value;

/// Outcome of a safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl SafetyVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

pub trait SafetyPolicy: Send + Sync {
    fn check_tool(&self, name: &str, input: &Value) -> SafetyVerdict;
}

/// Allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl SafetyPolicy for AllowAll {
    fn check_tool(&self, _name: &str, _input: &Value) -> SafetyVerdict {
        SafetyVerdict::allow()
    }
}

/// How a blocked pattern is compared with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Match {
    /// The command's leading words are exactly the pattern's words.
    Words,
    /// As `Words`, except the last word only has to start with the
    /// pattern's last word (`mkfs` matches `mkfs.ext4`).
    Prefix,
    /// The pattern occurs anywhere in the command.
    Anywhere,
}

/// Command patterns that are refused outright.
const DANGEROUS_PATTERNS: &[(&str, Match, &str)] = &[
    ("rm -rf /", Match::Words, "This would destroy the entire system"),
    ("rm -rf /*", Match::Words, "This would destroy the entire system"),
    ("rm -fr /", Match::Words, "This would destroy the entire system"),
    ("rm -fr /*", Match::Words, "This would destroy the entire system"),
    ("rm -rf ~", Match::Words, "This would delete the home directory"),
    ("rm -rf ~/", Match::Words, "This would delete the home directory"),
    ("mkfs", Match::Prefix, "Formatting filesystems is blocked"),
    ("dd if=/dev/", Match::Prefix, "Direct disk operations are blocked"),
    ("> /dev/sd", Match::Anywhere, "Writing to block devices is blocked"),
    ("chmod -R 777 /", Match::Words, "Recursive permission changes on / are blocked"),
    (":(){ :|:& };:", Match::Anywhere, "Fork bombs are blocked"),
    ("shutdown", Match::Words, "Power management commands are blocked"),
    ("reboot", Match::Words, "Power management commands are blocked"),
];

#[derive(Debug, Clone)]
struct BlockedPattern {
    pattern: String,
    kind: Match,
    reason: String,
}

impl BlockedPattern {
    fn matches(&self, cmd: &str) -> bool {
        if self.kind == Match::Anywhere {
            return cmd.contains(self.pattern.as_str());
        }
        let expected: Vec<&str> = self.pattern.split_whitespace().collect();
        let words: Vec<&str> = cmd.split_whitespace().take(expected.len()).collect();
        if expected.is_empty() || words.len() < expected.len() {
            return false;
        }
        let last = expected.len() - 1;
        expected
            .iter()
            .zip(&words)
            .enumerate()
            .all(|(i, (want, got))| {
                if i == last && self.kind == Match::Prefix {
                    got.starts_with(want)
                } else {
                    want == got
                }
            })
    }
}

/// Prefixes that wrap a command without changing what it does.
const COMMAND_PREFIXES: &[&str] = &["sudo ", "time ", "nice ", "nohup "];

/// Tools whose input names a file or directory.
const PATH_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "NotebookEdit",
    "Glob",
    "Grep",
    "LS",
];
const PATH_KEYS: &[&str] = &["file_path", "notebook_path", "path"];

/// Blocks dangerous shell commands and, when roots are configured, file
/// tools that reach outside them.
#[derive(Debug, Clone)]
pub struct PatternSafetyPolicy {
    patterns: Vec<BlockedPattern>,
    allowed_roots: Vec<PathBuf>,
}

impl Default for PatternSafetyPolicy {
    fn default() -> Self {
        Self {
            patterns: DANGEROUS_PATTERNS
                .iter()
                .map(|(pattern, kind, reason)| BlockedPattern {
                    pattern: pattern.to_string(),
                    kind: *kind,
                    reason: reason.to_string(),
                })
                .collect(),
            allowed_roots: Vec::new(),
        }
    }
}

impl PatternSafetyPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocked_patterns(mut self, extra: impl IntoIterator<Item = String>) -> Self {
        for pattern in extra {
            self.patterns.push(BlockedPattern {
                pattern,
                kind: Match::Words,
                reason: "Blocked by configuration".to_string(),
            });
        }
        self
    }

    pub fn with_allowed_roots(mut self, roots: impl IntoIterator<Item = PathBuf>) -> Self {
        self.allowed_roots
            .extend(roots.into_iter().map(|root| normalize(&root)));
        self
    }

    /// Returns the blocking reason for one simple command.
    fn blocked_command(&self, cmd: &str) -> Option<String> {
        let mut cmd = cmd.trim();
        // Strip any stack of wrapper prefixes ("sudo nice rm ...").
        while let Some(rest) = COMMAND_PREFIXES
            .iter()
            .find_map(|prefix| cmd.strip_prefix(prefix))
        {
            cmd = rest.trim_start();
        }
        self.patterns
            .iter()
            .find(|blocked| blocked.matches(cmd))
            .map(|blocked| {
                format!(
                    "Blocked dangerous command pattern '{}'. {}",
                    blocked.pattern, blocked.reason
                )
            })
    }

    fn check_command(&self, command: &str) -> SafetyVerdict {
        if let Some(reason) = self.blocked_command(command) {
            return SafetyVerdict::deny(reason);
        }
        for part in command.split(['&', '|', ';', '\n']) {
            if let Some(reason) = self.blocked_command(part) {
                return SafetyVerdict::deny(reason);
            }
        }
        SafetyVerdict::allow()
    }

    fn check_path(&self, raw: &str) -> SafetyVerdict {
        if self.allowed_roots.is_empty() {
            return SafetyVerdict::allow();
        }
        let path = Path::new(raw);
        let resolved = if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.allowed_roots[0].join(path))
        };
        if self
            .allowed_roots
            .iter()
            .any(|root| resolved.starts_with(root))
        {
            SafetyVerdict::allow()
        } else {
            SafetyVerdict::deny(format!(
                "Path '{}' is outside the allowed directories",
                resolved.display()
            ))
        }
    }
}

impl SafetyPolicy for PatternSafetyPolicy {
    fn check_tool(&self, name: &str, input: &Value) -> SafetyVerdict {
        if name == "Bash" {
            if let Some(command) = input.get("command").and_then(Value::as_str) {
                return self.check_command(command);
            }
        }
        if PATH_TOOLS.contains(&name) {
            for key in PATH_KEYS {
                if let Some(raw) = input.get(*key).and_then(Value::as_str) {
                    let verdict = self.check_path(raw);
                    if !verdict.allowed {
                        return verdict;
                    }
                }
            }
        }
        SafetyVerdict::allow()
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Maps a message to an extended-thinking token budget (0 disables thinking).
pub trait ThinkingPolicy: Send + Sync {
    fn budget_for(&self, message: &str) -> u32;
}

impl<F> ThinkingPolicy for F
where
    F: Fn(&str) -> u32 + Send + Sync,
{
    fn budget_for(&self, message: &str) -> u32 {
        self(message)
    }
}

pub const DEEP_THINKING_TOKENS: u32 = 50_000;
pub const NORMAL_THINKING_TOKENS: u32 = 16_000;

const DEFAULT_KEYWORDS: &[&str] = &["think", "reason", "pensa", "ragiona"];
const DEFAULT_DEEP_KEYWORDS: &[&str] = &[
    "ultrathink",
    "think hard",
    "think deeply",
    "think carefully",
    "pensa bene",
];

/// Case-insensitive keyword match; deep keywords win over normal ones.
#[derive(Debug, Clone)]
pub struct KeywordThinkingPolicy {
    keywords: Vec<String>,
    deep_keywords: Vec<String>,
}

impl Default for KeywordThinkingPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            DEFAULT_DEEP_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        )
    }
}

impl KeywordThinkingPolicy {
    pub fn new(keywords: Vec<String>, deep_keywords: Vec<String>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            deep_keywords: deep_keywords.into_iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn deep_keywords(&self) -> &[String] {
        &self.deep_keywords
    }
}

impl ThinkingPolicy for KeywordThinkingPolicy {
    fn budget_for(&self, message: &str) -> u32 {
        let lower = message.to_lowercase();
        if self.deep_keywords.iter().any(|k| lower.contains(k.as_str())) {
            DEEP_THINKING_TOKENS
        } else if self.keywords.iter().any(|k| lower.contains(k.as_str())) {
            NORMAL_THINKING_TOKENS
        } else {
            0
        }
    }
}
