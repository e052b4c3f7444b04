//! Error types for the display session manager.
//!
//! Every error is returned to the caller of `submit`/`start`/`restart`; none of
//! them take the host process down. Errors are `Clone` because a coalesced
//! restart hands the same outcome to every caller it satisfied.

use crate::version::Version;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisplayError {
    #[error("Failed to spawn {executable}: {reason}")]
    Spawn { executable: String, reason: String },

    #[error("Version probe failed: {0}")]
    Probe(String),

    #[error("Unsupported toolchain version {found}, at least {required} is required")]
    UnsupportedVersion { found: Version, required: Version },

    #[error("Display session {0} was torn down before the request completed")]
    StaleSession(u64),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Display request failed: {message}")]
    SubprocessFailure {
        message: String,
        exit_code: Option<i32>,
    },

    #[error("Display server is not running")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Dispatcher channel closed")]
    WorkerClosed,
}

impl DisplayError {
    /// Whether resubmitting against a fresh session may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DisplayError::StaleSession(_) | DisplayError::NotRunning)
    }

    /// Whether this error aborted a session start attempt.
    pub fn is_start_failure(&self) -> bool {
        matches!(
            self,
            DisplayError::Spawn { .. }
                | DisplayError::Probe(_)
                | DisplayError::UnsupportedVersion { .. }
                | DisplayError::Config(_)
        )
    }

    /// Stable snake_case identifier used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            DisplayError::Spawn { .. } => "spawn_error",
            DisplayError::Probe(_) => "probe_error",
            DisplayError::UnsupportedVersion { .. } => "unsupported_version",
            DisplayError::StaleSession(_) => "stale_session",
            DisplayError::Cancelled => "cancelled",
            DisplayError::SubprocessFailure { .. } => "subprocess_failure",
            DisplayError::NotRunning => "not_running",
            DisplayError::Config(_) => "config_error",
            DisplayError::WorkerClosed => "worker_closed",
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DisplayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        DisplayError::WorkerClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for DisplayError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        DisplayError::WorkerClosed
    }
}
