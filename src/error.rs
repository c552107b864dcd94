//! Errors surfaced to callers of the admission controller and sessions.

use std::time::Duration;

use thiserror::Error;

use crate::backend::ProviderError;

/// Why a run was aborted before it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The user explicitly asked the run to stop.
    Stopped,
    /// A newer request for the same session superseded the run.
    Interrupted,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Stopped => write!(f, "stopped"),
            AbortReason::Interrupted => write!(f, "superseded by a newer request"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Queue is full ({current}/{max}), try again later")]
    QueueFull { current: usize, max: usize },

    #[error("Queue was cleared before this request could run")]
    QueueCleared,

    #[error("Request was dropped before its run finished")]
    RequestLost,

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Unsafe operation blocked: {reason}")]
    UnsafeOperation { reason: String },

    #[error("Backend crashed, session reset: {message}")]
    BackendCrash { message: String },

    #[error("Run aborted: {reason}")]
    Aborted { reason: AbortReason },

    #[error("Run exceeded the stale-run timeout after {}s", .elapsed.as_secs())]
    StaleRun { elapsed: Duration },

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl Error {
    /// Abort-shaped errors are cancellations, not failures.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted { .. })
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Error::Aborted { reason } => Some(*reason),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
