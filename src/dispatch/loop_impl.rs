//! The dispatch loop: sole owner of the attached channel.

use super::request::{
    CallFinished, DispatchCommand, PendingRequest, RawOutput, Responder, WorkerEvent,
};
use crate::error::DisplayError;
use crate::process::{wait_for_exit, Channel, ChannelError, ExitWatch, ProcessExit};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a failed call waits for the process exit to learn its code.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// The request currently being answered by the process.
struct InFlight {
    id: u64,
    generation: u64,
    label: String,
    token: CancellationToken,
    started: Instant,
    resp: Responder,
}

struct DispatchLoop {
    queue: VecDeque<PendingRequest>,
    /// Generation whose channel is attached, if any.
    attached: Option<u64>,
    /// Idle channel. `None` while a call holds it or nothing is attached.
    channel: Option<Box<dyn Channel>>,
    /// Exit of the attached process.
    exited: Option<ExitWatch>,
    in_flight: Option<InFlight>,
    done_tx: mpsc::UnboundedSender<CallFinished>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Run the dispatch loop until `Shutdown` is received or every handle is
/// dropped. Requests still pending at that point resolve as `WorkerClosed`.
pub(crate) async fn run_dispatch_loop(
    mut rx: mpsc::Receiver<DispatchCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut state = DispatchLoop {
        queue: VecDeque::new(),
        attached: None,
        channel: None,
        exited: None,
        in_flight: None,
        done_tx,
        events,
    };

    loop {
        tokio::select! {
            biased;
            cmd = rx.recv() => {
                match cmd {
                    Some(DispatchCommand::Shutdown) | None => break,
                    Some(cmd) => state.handle_command(cmd),
                }
            }
            Some(done) = done_rx.recv() => state.finish_call(done),
            exit = attached_exit(&mut state.exited) => state.process_exited(exit),
        }
        state.pump();
    }

    info!(queued = state.queue.len(), "Dispatch loop shutting down");
    state.resolve_all(|_| DisplayError::WorkerClosed);
}

/// Exit of the attached process. Pends while nothing is attached.
async fn attached_exit(exited: &mut Option<ExitWatch>) -> ProcessExit {
    match exited {
        Some(watch) => wait_for_exit(watch).await,
        None => std::future::pending().await,
    }
}

impl DispatchLoop {
    fn handle_command(&mut self, cmd: DispatchCommand) {
        match cmd {
            DispatchCommand::Submit {
                id,
                request,
                token,
                resp,
            } => {
                if token.is_cancelled() {
                    debug!(id, label = %request.label, "Request cancelled before queueing");
                    let _ = resp.send(Err(DisplayError::Cancelled));
                    return;
                }
                let Some(generation) = self.attached else {
                    debug!(id, label = %request.label, "Rejecting request, no session attached");
                    let _ = resp.send(Err(DisplayError::NotRunning));
                    return;
                };
                debug!(id, generation, label = %request.label, queued = self.queue.len(), "Queued request");
                self.queue.push_back(PendingRequest {
                    id,
                    request,
                    token,
                    generation,
                    resp,
                });
            }
            DispatchCommand::Cancel { id } => {
                if let Some(pos) = self.queue.iter().position(|r| r.id == id) {
                    if let Some(req) = self.queue.remove(pos) {
                        debug!(id, label = %req.request.label, "Cancelled queued request");
                        req.resolve(Err(DisplayError::Cancelled));
                    }
                } else if self.in_flight.as_ref().is_some_and(|f| f.id == id) {
                    debug!(id, "In-flight request cancelled, result will be discarded");
                }
            }
            DispatchCommand::Attach {
                generation,
                channel,
                exited,
                resp,
            } => {
                if let Some(old) = self.attached {
                    warn!(old, generation, "Attaching over a live session");
                    self.detach(old);
                }
                info!(generation, "Dispatcher attached to session");
                self.attached = Some(generation);
                self.channel = Some(channel);
                self.exited = Some(exited);
                let _ = resp.send(());
            }
            DispatchCommand::Detach { generation, resp } => {
                let drained = if self.attached == Some(generation) {
                    self.detach(generation)
                } else {
                    0
                };
                let _ = resp.send(drained);
            }
            DispatchCommand::Shutdown => {}
        }
    }

    /// Stop dispatching for `generation`, resolving everything it still owns
    /// as stale. An orphaned call keeps running until the process is killed;
    /// its completion is ignored.
    fn detach(&mut self, generation: u64) -> usize {
        self.attached = None;
        self.channel = None;
        self.exited = None;
        let drained = self.resolve_all(DisplayError::StaleSession);
        info!(generation, drained, "Dispatcher detached from session");
        drained
    }

    /// The attached process exited on its own, possibly while idle.
    fn process_exited(&mut self, exit: ProcessExit) {
        let Some(generation) = self.attached else {
            return;
        };
        warn!(generation, code = ?exit.code, "Display process exited while attached");
        self.lose_channel(generation, exit.to_string(), exit.code);
    }

    /// Fail the in-flight request, drain the queue as stale, detach and tell
    /// the lifecycle controller.
    fn lose_channel(&mut self, generation: u64, reason: String, exit_code: Option<i32>) {
        if let Some(f) = self.in_flight.take() {
            let _ = f.resp.send(if f.token.is_cancelled() {
                Err(DisplayError::Cancelled)
            } else {
                Err(DisplayError::SubprocessFailure {
                    message: reason.clone(),
                    exit_code,
                })
            });
        }
        self.detach(generation);
        let _ = self.events.send(WorkerEvent::ChannelLost {
            generation,
            reason,
            exit_code,
        });
    }

    fn resolve_all(&mut self, error: impl Fn(u64) -> DisplayError) -> usize {
        let mut count = 0;
        if let Some(f) = self.in_flight.take() {
            let _ = f.resp.send(Err(error(f.generation)));
            count += 1;
        }
        for req in self.queue.drain(..) {
            let generation = req.generation;
            req.resolve(Err(error(generation)));
            count += 1;
        }
        count
    }

    /// Start the next call if the channel is idle.
    fn pump(&mut self) {
        while self.in_flight.is_none() && self.channel.is_some() {
            let Some(req) = self.queue.pop_front() else {
                return;
            };
            if req.token.is_cancelled() {
                debug!(id = req.id, label = %req.request.label, "Skipping cancelled request");
                req.resolve(Err(DisplayError::Cancelled));
                continue;
            }
            if Some(req.generation) != self.attached {
                let generation = req.generation;
                req.resolve(Err(DisplayError::StaleSession(generation)));
                continue;
            }
            let Some(mut channel) = self.channel.take() else {
                return;
            };

            let PendingRequest {
                id,
                request,
                token,
                generation,
                resp,
            } = req;
            debug!(id, generation, label = %request.label, arguments = ?request.arguments, "Dispatching request");
            self.in_flight = Some(InFlight {
                id,
                generation,
                label: request.label,
                token,
                started: Instant::now(),
                resp,
            });

            let done_tx = self.done_tx.clone();
            let exited = self.exited.clone();
            let arguments = request.arguments;
            let stdin = request.stdin;
            tokio::spawn(async move {
                let result = channel.call(&arguments, stdin.as_deref()).await;
                let exit_code = match (&result, exited) {
                    (Err(ChannelError::Closed(_) | ChannelError::Io(_)), Some(mut exited)) => {
                        tokio::time::timeout(EXIT_GRACE, wait_for_exit(&mut exited))
                            .await
                            .ok()
                            .and_then(|exit| exit.code)
                    }
                    _ => None,
                };
                let _ = done_tx.send(CallFinished {
                    id,
                    generation,
                    channel,
                    result,
                    exit_code,
                });
            });
        }
    }

    fn finish_call(&mut self, done: CallFinished) {
        let current = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.id == done.id && f.generation == done.generation)
            && self.attached == Some(done.generation);
        if !current {
            debug!(id = done.id, generation = done.generation, "Dropping completion of a detached session");
            return;
        }
        let Some(f) = self.in_flight.take() else {
            return;
        };
        let elapsed_ms = f.started.elapsed().as_millis() as u64;

        let outcome = match done.result {
            Ok(response) => {
                self.channel = Some(done.channel);
                if f.token.is_cancelled() {
                    debug!(id = f.id, label = %f.label, elapsed_ms, "Discarding result of cancelled request");
                    Err(DisplayError::Cancelled)
                } else if response.has_error {
                    debug!(id = f.id, label = %f.label, elapsed_ms, "Display request failed");
                    Err(DisplayError::SubprocessFailure {
                        message: response.output,
                        exit_code: None,
                    })
                } else {
                    debug!(id = f.id, label = %f.label, elapsed_ms, "Display request completed");
                    Ok(RawOutput::from(response))
                }
            }
            Err(e) => {
                warn!(
                    id = f.id,
                    generation = f.generation,
                    exit_code = ?done.exit_code,
                    error = %e,
                    "Display process stopped answering"
                );
                let generation = f.generation;
                self.in_flight = Some(f);
                self.lose_channel(generation, e.to_string(), done.exit_code);
                return;
            }
        };
        let _ = f.resp.send(outcome);
    }
}
