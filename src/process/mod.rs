//! Process handle for the display subprocess.
//!
//! A spawn yields two halves:
//!
//! - [`Process`]: the kill side, owned by the session. Only the lifecycle
//!   controller kills processes. It also publishes the process exit on an
//!   [`ExitWatch`], whether the exit was asked for or not.
//! - [`Channel`]: the I/O side, owned by the dispatcher while the session is
//!   ready. One call writes one request and reads exactly one response.
//!
//! [`Spawner`] is the seam between the lifecycle controller and the OS; the
//! stdio implementation lives in [`stdio`].

pub mod protocol;
pub mod stdio;

use crate::config::ToolchainConfig;
use crate::error::DisplayError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

pub use protocol::Response;
pub use stdio::StdioSpawner;

/// How long a kill waits for the process to exit before giving up on it.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// How a display process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "display process exited with code {code}"),
            None => write!(f, "display process was terminated by a signal"),
        }
    }
}

/// `None` while the process runs, then its exit. Never goes back to `None`.
pub type ExitWatch = watch::Receiver<Option<ProcessExit>>;

/// Wait until `watch` reports an exit. Pends forever if the publisher is gone
/// without reporting one.
pub async fn wait_for_exit(watch: &mut ExitWatch) -> ProcessExit {
    let exit = match watch.wait_for(Option::is_some).await {
        Ok(exit) => *exit,
        Err(_) => None,
    };
    match exit {
        Some(exit) => exit,
        None => std::future::pending().await,
    }
}

/// Failure of a single call on a [`Channel`]. Any of these means the
/// subprocess can no longer be trusted to answer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("display process closed its output: {0}")]
    Closed(String),

    #[error("I/O error talking to display process: {0}")]
    Io(String),

    #[error("malformed response from display process: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => {
                ChannelError::Closed(e.to_string())
            }
            _ => ChannelError::Io(e.to_string()),
        }
    }
}

/// Request/response side of a display process.
#[async_trait]
pub trait Channel: Send {
    /// Write one request and wait for its response.
    async fn call(
        &mut self,
        arguments: &[String],
        stdin: Option<&str>,
    ) -> Result<Response, ChannelError>;
}

/// Kill side of a display process.
#[async_trait]
pub trait Process: Send {
    /// OS process id, if still known.
    fn id(&self) -> Option<u32>;

    /// Subscribe to the exit of this process.
    fn exit_watch(&self) -> ExitWatch;

    /// Terminate the process and wait up to [`KILL_TIMEOUT`] for it to exit.
    /// Idempotent and infallible, including after the process already exited
    /// on its own.
    async fn kill(&mut self);

    /// Exit code if the process has exited with one.
    fn exit_code(&self) -> Option<i32> {
        let exit = *self.exit_watch().borrow();
        exit.and_then(|exit| exit.code)
    }
}

/// A freshly spawned display process.
pub struct Spawned {
    pub process: Box<dyn Process>,
    pub channel: Box<dyn Channel>,
}

/// Starts display processes from a resolved configuration.
pub trait Spawner: Send + Sync {
    fn spawn(&self, config: &ToolchainConfig) -> Result<Spawned, DisplayError>;
}
