//! Provider error types with crash classification.
//!
//! The execution engine decides whether to retry from the `kind` alone, so a
//! provider must classify its failures instead of leaving callers to match on
//! error text.

/// Error raised by a backend provider while starting or streaming a query.
#[derive(Debug, Clone)]
pub struct ProviderError {
    /// The kind of error
    pub kind: ProviderErrorKind,
    /// Error message
    pub message: String,
    /// Process exit code, for subprocess backends
    pub exit_code: Option<i32>,
}

impl ProviderError {
    /// The backend process (or connection) died mid-run; its state may be corrupt.
    pub fn crashed(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            kind: ProviderErrorKind::Crashed,
            message: message.into(),
            exit_code,
        }
    }

    /// The query was cancelled through its cancellation token.
    pub fn cancelled() -> Self {
        Self {
            kind: ProviderErrorKind::Cancelled,
            message: "query cancelled".to_string(),
            exit_code: None,
        }
    }

    /// Any other backend failure (bad request, auth, spawn failure, reported error).
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Failed,
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn is_crash(&self) -> bool {
        self.kind == ProviderErrorKind::Crashed
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ProviderErrorKind::Cancelled
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} (exit code {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Classification of provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Process exited abnormally or the stream dropped - retried once with a fresh session
    Crashed,
    /// Cancellation observed - never retried
    Cancelled,
    /// Permanent failure - never retried
    Failed,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderErrorKind::Crashed => write!(f, "Backend crashed"),
            ProviderErrorKind::Cancelled => write!(f, "Backend cancelled"),
            ProviderErrorKind::Failed => write!(f, "Backend failed"),
        }
    }
}

/// Classify an HTTP status returned by an API backend.
///
/// Server-side failures leave no usable backend state behind, so they are
/// treated the same as a process crash.
pub fn classify_http_status(status: u16) -> ProviderErrorKind {
    match status {
        500..=599 => ProviderErrorKind::Crashed,
        _ => ProviderErrorKind::Failed,
    }
}
