//! JSON-lines front end over a [`SessionManager`].
//!
//! Requests are read line by line and handled concurrently, so a slow
//! `display` call never blocks a `cancel` or `status`. Replies and session
//! notifications share one writer task and never interleave mid-line.
//!
//! Automatic crash recovery lives here rather than in the session layer: a
//! `Crashed` event triggers a restart until [`MAX_CRASH_RESTARTS`] is used up.
//! An explicit `start` or `restart` refills the budget.

mod requests;
mod task;

pub use requests::*;
pub use task::RequestRegistry;

use crate::dispatch::DisplayRequest;
use crate::session::{SessionEvent, SessionManager};
use crate::version::Capabilities;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Automatic restarts after crashes before the server stays stopped.
pub const MAX_CRASH_RESTARTS: u32 = 3;

/// Counts automatic restarts since the last explicit start.
#[derive(Debug, Default)]
pub struct CrashBudget {
    used: AtomicU32,
}

impl CrashBudget {
    /// Take one restart from the budget. `false` once exhausted.
    pub fn try_take(&self) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < MAX_CRASH_RESTARTS).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn reset(&self) {
        self.used.store(0, Ordering::SeqCst);
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }
}

/// Request handler shared by all per-request tasks.
#[derive(Clone)]
struct DisplayServer {
    manager: Arc<SessionManager>,
    registry: RequestRegistry,
    budget: Arc<CrashBudget>,
    out: mpsc::UnboundedSender<String>,
}

impl DisplayServer {
    fn new(manager: Arc<SessionManager>, out: mpsc::UnboundedSender<String>) -> Self {
        Self {
            manager,
            registry: RequestRegistry::new(),
            budget: Arc::new(CrashBudget::default()),
            out,
        }
    }

    fn send<T: Serialize>(&self, message: &T) {
        match serde_json::to_string(message) {
            Ok(line) => {
                let _ = self.out.send(line);
            }
            Err(e) => warn!(error = %e, "Failed to encode outgoing message"),
        }
    }

    /// Handle one input line. Every request with a parseable envelope gets
    /// exactly one reply.
    async fn handle_line(&self, line: &str) {
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "Unparseable request line");
                self.send(&Reply::err(
                    Value::Null,
                    WireError::invalid_request(format!("invalid JSON request: {e}")),
                ));
                return;
            }
        };
        let id = envelope.id;
        let request = match ServerRequest::parse(&envelope.method, envelope.params) {
            Ok(request) => request,
            Err(message) => {
                self.send(&Reply::err(id, WireError::invalid_request(message)));
                return;
            }
        };
        let reply = self.handle(id.clone(), request).await;
        self.send(&reply);
    }

    async fn handle(&self, id: Value, request: ServerRequest) -> Reply {
        let outcome = match request {
            ServerRequest::Display(params) => return self.display(id, params.into()).await,
            ServerRequest::Cancel(params) => {
                let cancelled = self.registry.cancel(&params.id.to_string());
                debug!(target_id = %params.id, cancelled, "Cancel requested");
                Ok(json!({ "cancelled": cancelled }))
            }
            ServerRequest::Start => {
                self.budget.reset();
                self.manager.start().await.map(|info| json!(info))
            }
            ServerRequest::Stop => {
                self.manager.stop().await;
                Ok(json!({ "status": self.manager.status() }))
            }
            ServerRequest::Restart(params) => {
                self.budget.reset();
                let reason = params.reason.as_deref().unwrap_or("requested by client");
                self.manager.restart(reason).await.map(|info| json!(info))
            }
            ServerRequest::Status => Ok(self.status()),
        };
        match outcome {
            Ok(result) => Reply::ok(id, result),
            Err(e) => Reply::err(id, WireError::from(&e)),
        }
    }

    async fn display(&self, id: Value, request: DisplayRequest) -> Reply {
        let key = id.to_string();
        let Some(token) = self.registry.register(&key) else {
            return Reply::err(
                id,
                WireError::invalid_request(format!("request id {key} is already in flight")),
            );
        };
        let result = self.manager.submit(request, token).await;
        self.registry.finish(&key);
        match result {
            Ok(output) => Reply::ok(id, json!(output)),
            Err(e) => {
                debug!(id = %key, kind = e.kind(), error = %e, "Display request failed");
                Reply::err(id, WireError::from(&e))
            }
        }
    }

    fn status(&self) -> Value {
        let version = self.manager.current_version();
        json!({
            "status": self.manager.status(),
            "session": self.manager.info(),
            "capabilities": version.map(Capabilities::for_version),
            "pending": self.registry.len(),
            "crash_restarts": self.budget.used(),
        })
    }

    /// Forward session events to the client and restart after crashes while
    /// the budget allows.
    async fn watch_events(self, mut events: broadcast::Receiver<SessionEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Dropped session events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            self.send(&Notification {
                method: "session",
                params: &event,
            });
            if let SessionEvent::Crashed { generation, .. } = event {
                self.recover(generation);
            }
        }
    }

    fn recover(&self, generation: u64) {
        if !self.budget.try_take() {
            warn!(
                generation,
                limit = MAX_CRASH_RESTARTS,
                "Crash restart budget exhausted, staying stopped"
            );
            return;
        }
        info!(generation, attempt = self.budget.used(), "Restarting after crash");
        let manager = self.manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.restart("display process crashed").await {
                warn!(error = %e, "Restart after crash failed");
            }
        });
    }
}

/// Serve requests from `input` until it closes or `shutdown` resolves, then
/// shut the manager down. The session is started eagerly; a failed start is
/// reported as a log line and through `status`, not as an error.
pub async fn serve<R, W, F>(
    manager: Arc<SessionManager>,
    input: R,
    output: W,
    shutdown: F,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(output, out_rx));
    let server = DisplayServer::new(manager.clone(), out_tx);

    let events = tokio::spawn(server.clone().watch_events(manager.subscribe()));
    if let Err(e) = manager.start().await {
        warn!(error = %e, "Initial start failed; waiting for a start request");
    }

    let mut lines = BufReader::new(input).lines();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let server = server.clone();
                    tokio::spawn(async move { server.handle_line(&line).await });
                }
                None => {
                    info!("Input closed");
                    break;
                }
            },
        }
    }

    let cancelled = server.registry.cancel_all();
    if cancelled > 0 {
        debug!(cancelled, "Cancelled outstanding requests");
    }
    manager.shutdown().await;
    events.abort();
    drop(server);
    // Handler tasks still hold writer senders until their replies are out.
    match writer.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

async fn write_lines<W: AsyncWrite + Unpin>(
    mut output: W,
    mut lines: mpsc::UnboundedReceiver<String>,
) -> std::io::Result<()> {
    while let Some(line) = lines.recv().await {
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisplayServerSettings, Platform};
    use crate::test_support::FakeToolchain;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

    struct Client {
        input: DuplexStream,
        output: Lines<BufReader<DuplexStream>>,
        /// Messages read while looking for something else.
        backlog: VecDeque<Value>,
    }

    impl Client {
        async fn send(&mut self, line: Value) {
            let mut text = line.to_string();
            text.push('\n');
            self.input.write_all(text.as_bytes()).await.unwrap();
        }

        async fn next_matching(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
            if let Some(pos) = self.backlog.iter().position(&pred) {
                return self.backlog.remove(pos).unwrap();
            }
            loop {
                let line = tokio::time::timeout(Duration::from_secs(5), self.output.next_line())
                    .await
                    .expect("message in time")
                    .unwrap()
                    .expect("open stream");
                let message: Value = serde_json::from_str(&line).unwrap();
                if pred(&message) {
                    return message;
                }
                self.backlog.push_back(message);
            }
        }

        /// Reply carrying `id`.
        async fn reply(&mut self, id: Value) -> Value {
            self.next_matching(|m| m.get("method").is_none() && m.get("id") == Some(&id))
                .await
        }

        /// Oldest unread session notification.
        async fn event(&mut self) -> Value {
            let message = self.next_matching(|m| m["method"] == "session").await;
            message["params"].clone()
        }
    }

    fn start_server(
        fake: &FakeToolchain,
    ) -> (
        Client,
        tokio::task::JoinHandle<std::io::Result<()>>,
        Arc<SessionManager>,
    ) {
        let manager = SessionManager::new(
            Arc::new(DisplayServerSettings::default()),
            Arc::new(fake.clone()),
            Platform::Linux,
        );
        let (client_in, server_in) = duplex(64 * 1024);
        let (server_out, client_out) = duplex(64 * 1024);
        let handle = tokio::spawn(serve(
            manager.clone(),
            server_in,
            server_out,
            std::future::pending(),
        ));
        let client = Client {
            input: client_in,
            output: BufReader::new(client_out).lines(),
            backlog: VecDeque::new(),
        };
        (client, handle, manager)
    }

    #[test]
    fn crash_budget_runs_out_and_resets() {
        let budget = CrashBudget::default();
        for _ in 0..MAX_CRASH_RESTARTS {
            assert!(budget.try_take());
        }
        assert!(!budget.try_take());
        assert_eq!(budget.used(), MAX_CRASH_RESTARTS);
        budget.reset();
        assert!(budget.try_take());
    }

    #[tokio::test]
    async fn display_and_status_round_trip() {
        let fake = FakeToolchain::new("4.3.6");
        let (mut client, handle, _manager) = start_server(&fake);
        assert_eq!(client.event().await["event"], "ready");

        client
            .send(json!({"id": 1, "method": "display", "params": {"arguments": ["--display", "Main.hx@5@type"]}}))
            .await;
        let reply = client.reply(json!(1)).await;
        assert_eq!(reply["result"]["text"], "--display Main.hx@5@type");

        client.send(json!({"id": "s", "method": "status"})).await;
        let status = client.reply(json!("s")).await;
        assert_eq!(status["result"]["status"], "ready");
        assert_eq!(status["result"]["session"]["generation"], 1);
        assert_eq!(status["result"]["capabilities"]["json_rpc"], true);

        // Closing our end of the input stops the server; keep reading its output.
        let Client { input, output, .. } = client;
        drop(input);
        handle.await.unwrap().unwrap();
        drop(output);
        assert_eq!(fake.kills().len(), 1);
    }

    #[tokio::test]
    async fn cancel_reaches_queued_request() {
        let fake = FakeToolchain::new("4.3.6");
        let (mut client, _handle, _manager) = start_server(&fake);
        client.event().await;

        client
            .send(json!({"id": 1, "method": "display", "params": {"arguments": ["wait", "0"]}}))
            .await;
        fake.wait_for_calls(1).await;
        client
            .send(json!({"id": 2, "method": "display", "params": {"arguments": ["echo", "queued"]}}))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        client
            .send(json!({"id": 3, "method": "cancel", "params": {"id": 2}}))
            .await;
        assert_eq!(client.reply(json!(3)).await["result"]["cancelled"], true);
        let cancelled = client.reply(json!(2)).await;
        assert_eq!(cancelled["error"]["kind"], "cancelled");
        assert_eq!(cancelled["error"]["retryable"], false);

        fake.release(1);
        assert_eq!(client.reply(json!(1)).await["result"]["text"], "wait 0");
    }

    #[tokio::test]
    async fn malformed_lines_get_errors() {
        let fake = FakeToolchain::new("4.3.6");
        let (mut client, _handle, _manager) = start_server(&fake);
        client.event().await;

        client.input.write_all(b"{not json\n").await.unwrap();
        let reply = client.reply(Value::Null).await;
        assert_eq!(reply["error"]["kind"], "invalid_request");

        client.send(json!({"id": 9, "method": "compile"})).await;
        let reply = client.reply(json!(9)).await;
        assert_eq!(reply["error"]["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn crash_restarts_until_budget_is_spent() {
        let fake = FakeToolchain::new("4.3.6");
        let (mut client, _handle, manager) = start_server(&fake);
        assert_eq!(client.event().await["event"], "ready");

        for round in 0..=MAX_CRASH_RESTARTS {
            let id = json!(format!("crash-{round}"));
            client
                .send(json!({"id": id, "method": "display", "params": {"arguments": ["crash"]}}))
                .await;
            assert_eq!(client.reply(id).await["error"]["kind"], "subprocess_failure");
            assert_eq!(client.event().await["event"], "crashed");
            if round < MAX_CRASH_RESTARTS {
                // Automatic restart: teardown of a dead session is silent.
                assert_eq!(client.event().await["event"], "ready");
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fake.spawn_count(), 1 + MAX_CRASH_RESTARTS as usize);
        assert_eq!(manager.status(), crate::session::SessionStatus::Stopped);

        // An explicit restart brings it back and refills the budget.
        client.send(json!({"id": "r", "method": "restart"})).await;
        let reply = client.reply(json!("r")).await;
        assert_eq!(reply["result"]["generation"], 2 + MAX_CRASH_RESTARTS);
    }
}
