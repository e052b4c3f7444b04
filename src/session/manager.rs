//! Session lifecycle controller for the display server.

use super::types::{Session, SessionEvent, SessionInfo, SessionStatus};
use crate::config::{Platform, SettingsProvider};
use crate::dispatch::{Dispatcher, DisplayRequest, RawOutput, WorkerEvent};
use crate::error::DisplayError;
use crate::process::{Spawned, Spawner};
use crate::version::{self, Version};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Buffered lifecycle events per subscriber before the slowest one lags.
const EVENT_CAPACITY: usize = 32;

/// State guarded by the lifecycle lock.
#[derive(Default)]
struct Lifecycle {
    session: Option<Session>,
    /// Highest restart ticket already satisfied by a completed restart.
    restarts_covered: u64,
    /// Outcome handed to restart callers that were coalesced.
    last_restart: Option<Result<SessionInfo, DisplayError>>,
}

/// Owns the display process lifetime: start, stop, restart and crash
/// detection. Requests go through [`SessionManager::submit`].
pub struct SessionManager {
    settings: Arc<dyn SettingsProvider>,
    spawner: Arc<dyn Spawner>,
    platform: Platform,
    dispatcher: Dispatcher,
    lifecycle: Mutex<Lifecycle>,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    /// Snapshot of the current session, readable without the lifecycle lock
    /// while a start or restart holds it.
    current: RwLock<Option<SessionInfo>>,
    generation: AtomicU64,
    restart_tickets: AtomicU64,
}

impl SessionManager {
    /// Create a stopped manager. Must be called inside a tokio runtime.
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        spawner: Arc<dyn Spawner>,
        platform: Platform,
    ) -> Arc<Self> {
        let (dispatcher, worker_events) = Dispatcher::spawn();
        let (status, _) = watch::channel(SessionStatus::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let manager = Arc::new(Self {
            settings,
            spawner,
            platform,
            dispatcher,
            lifecycle: Mutex::new(Lifecycle::default()),
            status,
            events,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            restart_tickets: AtomicU64::new(0),
        });
        tokio::spawn(monitor(Arc::downgrade(&manager), worker_events));
        manager
    }

    /// Start the display server. Returns the running session if one exists.
    pub async fn start(&self) -> Result<SessionInfo, DisplayError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(session) = &lifecycle.session {
            debug!(generation = session.generation, "Display server already running");
            return Ok(session.info());
        }
        self.start_locked(&mut lifecycle).await
    }

    /// Stop the display server. Queued and in-flight requests resolve as
    /// `StaleSession`. Stopping a stopped server does nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.session.is_none() {
            debug!("Display server already stopped");
            return;
        }
        self.set_status(SessionStatus::Stopping);
        self.teardown(&mut lifecycle).await;
        self.set_status(SessionStatus::Stopped);
    }

    /// Tear the current session down and start a new one with freshly loaded
    /// settings.
    ///
    /// Restarts never interleave. Every restart requested before a restart
    /// begins its teardown is satisfied by that restart and gets its result.
    pub async fn restart(&self, reason: &str) -> Result<SessionInfo, DisplayError> {
        let ticket = self.restart_tickets.fetch_add(1, Ordering::SeqCst) + 1;
        info!(reason, ticket, "Restarting display server");

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.restarts_covered >= ticket {
            if let Some(result) = &lifecycle.last_restart {
                debug!(ticket, covered = lifecycle.restarts_covered, "Restart coalesced");
                return result.clone();
            }
        }

        lifecycle.restarts_covered = self.restart_tickets.load(Ordering::SeqCst);
        self.set_status(SessionStatus::Restarting);
        self.teardown(&mut lifecycle).await;
        let result = self.start_locked(&mut lifecycle).await;
        lifecycle.last_restart = Some(result.clone());
        result
    }

    /// Submit a display request to the current session.
    pub async fn submit(
        &self,
        request: DisplayRequest,
        token: CancellationToken,
    ) -> Result<RawOutput, DisplayError> {
        self.dispatcher.submit(request, token).await
    }

    /// Version of the running toolchain, `None` until a probe succeeded.
    pub fn current_version(&self) -> Option<Version> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|info| info.version)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the running session, if any. Never waits for a start in
    /// progress.
    pub fn info(&self) -> Option<SessionInfo> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stop the session and terminate the dispatcher.
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Err(e) = self.dispatcher.shutdown().await {
            debug!(error = %e, "Dispatcher already closed");
        }
    }

    async fn start_locked(&self, lifecycle: &mut Lifecycle) -> Result<SessionInfo, DisplayError> {
        self.set_status(SessionStatus::Starting);
        match self.launch().await {
            Ok(session) => {
                let info = session.info();
                self.set_current(Some(info.clone()));
                lifecycle.session = Some(session);
                self.set_status(SessionStatus::Ready);
                info!(
                    generation = info.generation,
                    version = %info.version,
                    pid = ?info.pid,
                    "Display server ready"
                );
                let _ = self.events.send(SessionEvent::Ready {
                    generation: info.generation,
                    version: info.version,
                });
                Ok(info)
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Display server failed to start");
                self.set_status(SessionStatus::Stopped);
                Err(e)
            }
        }
    }

    /// Resolve settings, spawn, probe and attach. Kills the process on any
    /// failure after the spawn.
    async fn launch(&self) -> Result<Session, DisplayError> {
        let config = self.settings.load()?.resolve(self.platform);
        info!(
            executable = %config.executable,
            arguments = ?config.arguments,
            platform = %self.platform,
            "Starting display server"
        );
        let Spawned {
            mut process,
            mut channel,
        } = self.spawner.spawn(&config)?;

        let probed = version::probe(&mut *channel)
            .await
            .and_then(version::check_supported);
        let version = match probed {
            Ok(version) => version,
            Err(e) => {
                process.kill().await;
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(e) = self
            .dispatcher
            .attach(generation, channel, process.exit_watch())
            .await
        {
            process.kill().await;
            return Err(e);
        }
        Ok(Session::new(process, config, version, generation))
    }

    /// Detach the dispatcher, then kill and wait for the exit. Leaves the
    /// status to the caller.
    async fn teardown(&self, lifecycle: &mut Lifecycle) {
        let Some(mut session) = lifecycle.session.take() else {
            return;
        };
        let generation = session.generation;
        let drained = match self.dispatcher.detach(generation).await {
            Ok(drained) => drained,
            Err(e) => {
                warn!(generation, error = %e, "Dispatcher gone during teardown");
                0
            }
        };
        session.process.kill().await;
        self.set_current(None);
        info!(
            generation,
            drained,
            exit_code = ?session.process.exit_code(),
            "Display server stopped"
        );
        let _ = self.events.send(SessionEvent::Stopped { generation });
    }

    async fn handle_worker_event(&self, event: WorkerEvent) {
        let WorkerEvent::ChannelLost {
            generation,
            reason,
            exit_code,
        } = event;
        let mut lifecycle = self.lifecycle.lock().await;
        let current = lifecycle
            .session
            .as_ref()
            .is_some_and(|s| s.generation == generation);
        if !current {
            debug!(generation, "Ignoring channel loss of a retired session");
            return;
        }
        let Some(mut session) = lifecycle.session.take() else {
            return;
        };
        session.process.kill().await;
        let exit_code = exit_code.or_else(|| session.process.exit_code());
        self.set_current(None);
        self.set_status(SessionStatus::Stopped);
        warn!(generation, exit_code = ?exit_code, reason = %reason, "Display server crashed");
        let _ = self.events.send(SessionEvent::Crashed {
            generation,
            reason,
            exit_code,
        });
    }

    fn set_status(&self, status: SessionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(from = %previous, to = %status, "Session status changed");
        }
    }

    fn set_current(&self, info: Option<SessionInfo>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = info;
    }
}

/// Forward dispatcher notifications to the manager for as long as it lives.
async fn monitor(manager: Weak<SessionManager>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_worker_event(event).await;
    }
}
