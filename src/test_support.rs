//! In-memory toolchain doubles shared by the dispatcher and session tests.
//!
//! A fake process answers by its first argument:
//!
//! - `-version`: the configured version string (counted as a probe, not a call)
//! - `wait`: blocks until [`FakeToolchain::release`] hands out a permit; a
//!   second argument of `crash` then exits the process with code 1
//! - `fail`: an error response carrying the remaining arguments
//! - `crash`: the process exits at once, with the code given as the second
//!   argument or 1
//! - anything else: echoes the arguments joined by spaces
//!
//! [`FakeToolchain::exit`] ends a process without any request in flight.

use crate::config::{DisplayServerSettings, SettingsProvider, ToolchainConfig};
use crate::error::DisplayError;
use crate::process::{
    Channel, ChannelError, ExitWatch, Process, ProcessExit, Response, Spawned, Spawner,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

const FIRST_PID: u32 = 4000;
const CRASH_CODE: i32 = 1;

type ExitSender = Arc<watch::Sender<Option<ProcessExit>>>;

struct FakeState {
    version: Mutex<String>,
    fail_spawn: AtomicBool,
    spawned: Mutex<Vec<ToolchainConfig>>,
    calls: Mutex<Vec<Vec<String>>>,
    probes: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    kills: Mutex<Vec<u32>>,
    exits: Mutex<HashMap<u32, ExitSender>>,
    gate: Semaphore,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            version: Mutex::new(String::new()),
            fail_spawn: AtomicBool::new(false),
            spawned: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            kills: Mutex::new(Vec::new()),
            exits: Mutex::new(HashMap::new()),
            gate: Semaphore::new(0),
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeToolchain {
    state: Arc<FakeState>,
}

impl FakeToolchain {
    pub fn new(version: &str) -> Self {
        let fake = Self::default();
        fake.set_version(version);
        fake
    }

    pub fn set_version(&self, version: &str) {
        *lock(&self.state.version) = version.to_string();
    }

    pub fn fail_spawn(&self, fail: bool) {
        self.state.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Let `n` blocked `wait` calls answer.
    pub fn release(&self, n: usize) {
        self.state.gate.add_permits(n);
    }

    /// Non-probe calls in the order they reached a process.
    pub fn calls(&self) -> Vec<Vec<String>> {
        lock(&self.state.calls).clone()
    }

    pub fn probes(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn spawn_count(&self) -> usize {
        lock(&self.state.spawned).len()
    }

    /// Configurations passed to the spawner, oldest first.
    pub fn spawned_configs(&self) -> Vec<ToolchainConfig> {
        lock(&self.state.spawned).clone()
    }

    /// End process `pid` on its own, as if it crashed while idle.
    pub fn exit(&self, pid: u32, code: Option<i32>) {
        if let Some(exit) = lock(&self.state.exits).get(&pid) {
            exit.send_replace(Some(ProcessExit { code }));
        }
    }

    /// Pids of processes killed while still running, once per process.
    pub fn kills(&self) -> Vec<u32> {
        lock(&self.state.kills).clone()
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..500 {
            if lock(&self.state.calls).len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {n} calls, saw {:?}", self.calls());
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Spawner for FakeToolchain {
    fn spawn(&self, config: &ToolchainConfig) -> Result<Spawned, DisplayError> {
        if self.state.fail_spawn.load(Ordering::SeqCst) {
            return Err(DisplayError::Spawn {
                executable: config.executable.clone(),
                reason: "No such file or directory".to_string(),
            });
        }
        let pid = {
            let mut spawned = lock(&self.state.spawned);
            spawned.push(config.clone());
            FIRST_PID + spawned.len() as u32
        };
        let killed = CancellationToken::new();
        let exit: ExitSender = Arc::new(watch::channel(None).0);
        lock(&self.state.exits).insert(pid, exit.clone());
        Ok(Spawned {
            process: Box::new(FakeProcess {
                pid,
                killed: killed.clone(),
                exit: exit.clone(),
                state: self.state.clone(),
            }),
            channel: Box::new(FakeChannel {
                killed,
                exit,
                state: self.state.clone(),
            }),
        })
    }
}

struct FakeProcess {
    pid: u32,
    killed: CancellationToken,
    exit: ExitSender,
    state: Arc<FakeState>,
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn exit_watch(&self) -> ExitWatch {
        self.exit.subscribe()
    }

    async fn kill(&mut self) {
        if self.exit.borrow().is_some() {
            return;
        }
        self.killed.cancel();
        self.exit.send_replace(Some(ProcessExit { code: None }));
        lock(&self.state.kills).push(self.pid);
    }
}

struct FakeChannel {
    killed: CancellationToken,
    exit: ExitSender,
    state: Arc<FakeState>,
}

impl FakeChannel {
    fn crash(&self, code: i32) -> ChannelError {
        self.exit.send_replace(Some(ProcessExit { code: Some(code) }));
        ChannelError::Closed("process exited".to_string())
    }

    async fn answer(&self, arguments: &[String]) -> Result<Response, ChannelError> {
        let rest = arguments.get(1..).unwrap_or_default().join(" ");
        match arguments.first().map(String::as_str) {
            Some("wait") => {
                tokio::select! {
                    permit = self.state.gate.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                    }
                    _ = self.killed.cancelled() => {
                        return Err(ChannelError::Closed("killed".to_string()));
                    }
                }
                if rest == "crash" {
                    return Err(self.crash(CRASH_CODE));
                }
            }
            Some("fail") => {
                return Ok(Response {
                    output: format!("{rest}\n"),
                    prints: Vec::new(),
                    has_error: true,
                })
            }
            Some("crash") => {
                let code = rest.parse().unwrap_or(CRASH_CODE);
                return Err(self.crash(code));
            }
            _ => {}
        }
        Ok(Response {
            output: arguments.join(" "),
            prints: Vec::new(),
            has_error: false,
        })
    }
}

#[async_trait]
impl Channel for FakeChannel {
    async fn call(
        &mut self,
        arguments: &[String],
        _stdin: Option<&str>,
    ) -> Result<Response, ChannelError> {
        if self.killed.is_cancelled() || self.exit.borrow().is_some() {
            return Err(ChannelError::Closed("process exited".to_string()));
        }
        if arguments.first().map(String::as_str) == Some("-version") {
            self.state.probes.fetch_add(1, Ordering::SeqCst);
            return Ok(Response {
                output: format!("{}\n", lock(&self.state.version)),
                prints: Vec::new(),
                has_error: false,
            });
        }

        lock(&self.state.calls).push(arguments.to_vec());
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(active, Ordering::SeqCst);
        let result = self.answer(arguments).await;
        self.state.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Settings that tests can change between starts.
#[derive(Default)]
pub(crate) struct MutableSettings {
    settings: Mutex<DisplayServerSettings>,
}

impl MutableSettings {
    pub fn set_executable(&self, executable: &str) {
        lock(&self.settings).base.executable = executable.to_string();
    }
}

impl SettingsProvider for MutableSettings {
    fn load(&self) -> Result<DisplayServerSettings, DisplayError> {
        Ok(lock(&self.settings).clone())
    }
}
