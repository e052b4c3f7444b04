//! Session, session info and lifecycle event types.

use crate::config::ToolchainConfig;
use crate::process::Process;
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the display server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No process. Submissions are rejected with `NotRunning`.
    Stopped,
    /// Spawning and probing a new process.
    Starting,
    /// Attached to the dispatcher and answering requests.
    Ready,
    /// Tearing the current process down.
    Stopping,
    /// Tearing down before starting again.
    Restarting,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Stopped => write!(f, "stopped"),
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Stopping => write!(f, "stopping"),
            SessionStatus::Restarting => write!(f, "restarting"),
        }
    }
}

/// Information about a running session (serializable for API responses).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Monotonic session number; requests are stamped with it.
    pub generation: u64,
    pub executable: String,
    pub arguments: Vec<String>,
    pub version: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// One subprocess lifetime. Owned by the lifecycle controller only.
pub struct Session {
    pub(crate) process: Box<dyn Process>,
    pub(crate) config: ToolchainConfig,
    pub(crate) version: Version,
    pub(crate) generation: u64,
    pub(crate) started_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(
        process: Box<dyn Process>,
        config: ToolchainConfig,
        version: Version,
        generation: u64,
    ) -> Self {
        Self {
            process,
            config,
            version,
            generation,
            started_at: Utc::now(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            generation: self.generation,
            executable: self.config.executable.clone(),
            arguments: self.config.arguments.clone(),
            version: self.version,
            pid: self.process.id(),
            started_at: self.started_at,
        }
    }
}

/// Lifecycle notifications broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Ready { generation: u64, version: Version },
    Stopped { generation: u64 },
    /// The process stopped answering or exited on its own.
    Crashed {
        generation: u64,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl SessionEvent {
    pub fn generation(&self) -> u64 {
        match self {
            SessionEvent::Ready { generation, .. }
            | SessionEvent::Stopped { generation }
            | SessionEvent::Crashed { generation, .. } => *generation,
        }
    }
}
