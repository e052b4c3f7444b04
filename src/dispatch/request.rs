//! Request and command types for the dispatch loop.

use crate::error::DisplayError;
use crate::process::{Channel, ChannelError, ExitWatch, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A display-mode call as submitted by a feature handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRequest {
    /// Short name used in logs (e.g. "hover").
    #[serde(default)]
    pub label: String,
    #[serde(alias = "args")]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl DisplayRequest {
    pub fn new(arguments: Vec<String>) -> Self {
        Self {
            label: String::new(),
            arguments,
            stdin: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Successful response body. Parsing is left to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawOutput {
    pub text: String,
    pub prints: Vec<String>,
}

impl From<Response> for RawOutput {
    fn from(r: Response) -> Self {
        Self {
            text: r.output,
            prints: r.prints,
        }
    }
}

pub(crate) type Responder = oneshot::Sender<Result<RawOutput, DisplayError>>;

/// A request accepted by the loop, stamped with the generation it belongs to.
pub(crate) struct PendingRequest {
    pub id: u64,
    pub request: DisplayRequest,
    pub token: CancellationToken,
    pub generation: u64,
    pub resp: Responder,
}

impl PendingRequest {
    /// Resolve this request. Consumes it, so it can happen only once.
    pub fn resolve(self, result: Result<RawOutput, DisplayError>) {
        let _ = self.resp.send(result);
    }
}

pub(crate) enum DispatchCommand {
    Submit {
        id: u64,
        request: DisplayRequest,
        token: CancellationToken,
        resp: Responder,
    },
    /// The caller's token fired; drop the request if it is still queued.
    Cancel { id: u64 },
    /// Hand the channel of a freshly started session to the loop, along with
    /// the exit of its process.
    Attach {
        generation: u64,
        channel: Box<dyn Channel>,
        exited: ExitWatch,
        resp: oneshot::Sender<()>,
    },
    /// Stop dispatching for `generation`; replies with the number of requests
    /// that were resolved as stale.
    Detach {
        generation: u64,
        resp: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Sent back to the loop by the task that ran a call.
pub(crate) struct CallFinished {
    pub id: u64,
    pub generation: u64,
    pub channel: Box<dyn Channel>,
    pub result: Result<Response, ChannelError>,
    /// Exit code of the process, when the call failed because it exited.
    pub exit_code: Option<i32>,
}

/// Notifications from the loop to the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The channel of `generation` failed or its process exited while
    /// attached. The process is presumed dead.
    ChannelLost {
        generation: u64,
        reason: String,
        exit_code: Option<i32>,
    },
}
