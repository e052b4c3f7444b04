//! Dispatcher handle for submitting display requests.

use super::loop_impl::run_dispatch_loop;
use super::request::{DispatchCommand, DisplayRequest, RawOutput, WorkerEvent};
use crate::error::DisplayError;
use crate::process::{Channel, ExitWatch};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capacity of the command channel feeding the dispatch loop. The loop drains
/// it into its own queue, so this only bounds bursts.
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Cloneable handle to the dispatch loop.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<DispatchCommand>,
    next_id: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Spawn the dispatch loop on the current tokio runtime.
    ///
    /// The returned receiver yields [`WorkerEvent`]s for the lifecycle
    /// controller.
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatch_loop(rx, events_tx));
        (
            Self {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            events_rx,
        )
    }

    /// Submit a request and wait for its single outcome.
    ///
    /// A token cancelled while the request is queued resolves it as
    /// `Cancelled` right away. A token cancelled while the request is in
    /// flight resolves it as `Cancelled` once the process has answered.
    pub async fn submit(
        &self,
        request: DisplayRequest,
        token: CancellationToken,
    ) -> Result<RawOutput, DisplayError> {
        if token.is_cancelled() {
            return Err(DisplayError::Cancelled);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (resp_tx, mut resp_rx) = oneshot::channel();
        self.tx
            .send(DispatchCommand::Submit {
                id,
                request,
                token: token.clone(),
                resp: resp_tx,
            })
            .await?;

        tokio::select! {
            biased;
            result = &mut resp_rx => return result?,
            _ = token.cancelled() => {
                debug!(id, "Submitter cancelled request");
                self.tx.send(DispatchCommand::Cancel { id }).await?;
            }
        }
        resp_rx.await?
    }

    /// Start dispatching `generation` on `channel`. An exit reported by
    /// `exited` while attached fails the session like a broken channel.
    pub(crate) async fn attach(
        &self,
        generation: u64,
        channel: Box<dyn Channel>,
        exited: ExitWatch,
    ) -> Result<(), DisplayError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(DispatchCommand::Attach {
                generation,
                channel,
                exited,
                resp: resp_tx,
            })
            .await?;
        Ok(resp_rx.await?)
    }

    /// Stop dispatching for `generation`. Once this returns no further call of
    /// that generation will be started, so its process may be killed.
    pub(crate) async fn detach(&self, generation: u64) -> Result<usize, DisplayError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(DispatchCommand::Detach {
                generation,
                resp: resp_tx,
            })
            .await?;
        Ok(resp_rx.await?)
    }

    /// Terminate the dispatch loop. Outstanding requests resolve as
    /// `WorkerClosed`.
    pub async fn shutdown(&self) -> Result<(), DisplayError> {
        self.tx.send(DispatchCommand::Shutdown).await?;
        Ok(())
    }
}
