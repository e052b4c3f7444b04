//! Display process spoken to over stdin/stderr.

use super::protocol::{self, Response, MAX_RESPONSE_LEN};
use super::{
    wait_for_exit, Channel, ChannelError, ExitWatch, Process, ProcessExit, Spawned, Spawner,
    KILL_TIMEOUT,
};
use crate::config::ToolchainConfig;
use crate::error::DisplayError;
use crate::expand_path;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Arguments that put the compiler into stdio server mode.
pub const DEFAULT_SERVER_ARGUMENTS: [&str; 2] = ["--wait", "stdio"];

/// Spawns compiler servers speaking the length-prefixed stdio protocol.
#[derive(Debug, Clone)]
pub struct StdioSpawner {
    server_arguments: Vec<String>,
    working_directory: Option<PathBuf>,
}

impl Default for StdioSpawner {
    fn default() -> Self {
        Self {
            server_arguments: DEFAULT_SERVER_ARGUMENTS.iter().map(|s| s.to_string()).collect(),
            working_directory: None,
        }
    }
}

impl StdioSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the arguments appended after the configured ones.
    pub fn with_server_arguments(mut self, arguments: Vec<String>) -> Self {
        self.server_arguments = arguments;
        self
    }

    pub fn with_working_directory(mut self, dir: PathBuf) -> Self {
        self.working_directory = Some(dir);
        self
    }
}

impl Spawner for StdioSpawner {
    fn spawn(&self, config: &ToolchainConfig) -> Result<Spawned, DisplayError> {
        let executable = expand_path(&config.executable);
        let spawn_error = |reason: String| DisplayError::Spawn {
            executable: config.executable.clone(),
            reason,
        };

        let mut command = Command::new(&executable);
        command
            .args(&config.arguments)
            .args(&self.server_arguments)
            .envs(&config.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("stdin not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error("stderr not captured".to_string()))?;
        let stdout = child.stdout.take();

        let pid = child.id();
        info!(
            executable = %executable.display(),
            arguments = ?config.arguments,
            pid = ?pid,
            "Spawned display process"
        );

        if let Some(stdout) = stdout {
            tokio::spawn(forward_stdout(stdout, pid));
        }
        let kill = CancellationToken::new();
        let (exit_tx, exited) = watch::channel(None);
        tokio::spawn(reap(child, pid, kill.clone(), exit_tx));

        Ok(Spawned {
            process: Box::new(StdioProcess { pid, kill, exited }),
            channel: Box::new(StdioChannel {
                stdin,
                stderr: BufReader::new(stderr),
            }),
        })
    }
}

/// The server's own stdout carries nothing we answer from; keep it visible in
/// the debug log and keep the pipe drained.
async fn forward_stdout(stdout: ChildStdout, pid: Option<u32>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(pid = ?pid, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(pid = ?pid, error = %e, "Display process stdout closed");
                break;
            }
        }
    }
}

/// Own the child until it exits, killing it once `kill` fires, and publish
/// the exit.
async fn reap(
    mut child: Child,
    pid: Option<u32>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                warn!(pid = ?pid, error = %e, "Failed to kill display process");
            }
            child.wait().await
        }
    };
    let exit = match status {
        Ok(status) => ProcessExit {
            code: status.code(),
        },
        Err(e) => {
            warn!(pid = ?pid, error = %e, "Failed to wait for display process");
            ProcessExit::default()
        }
    };
    debug!(pid = ?pid, code = ?exit.code, "Display process exited");
    exit_tx.send_replace(Some(exit));
}

pub struct StdioProcess {
    pid: Option<u32>,
    kill: CancellationToken,
    exited: ExitWatch,
}

#[async_trait]
impl Process for StdioProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn exit_watch(&self) -> ExitWatch {
        self.exited.clone()
    }

    async fn kill(&mut self) {
        let already = *self.exited.borrow();
        if let Some(exit) = already {
            debug!(pid = ?self.pid, code = ?exit.code, "Display process already exited");
            return;
        }
        if !self.kill.is_cancelled() {
            self.kill.cancel();
            info!(pid = ?self.pid, "Killing display process");
        }
        let mut exited = self.exited.clone();
        match tokio::time::timeout(KILL_TIMEOUT, wait_for_exit(&mut exited)).await {
            Ok(exit) => debug!(pid = ?self.pid, code = ?exit.code, "Display process reaped"),
            Err(_) => warn!(
                pid = ?self.pid,
                timeout_secs = KILL_TIMEOUT.as_secs(),
                "Display process did not exit after kill"
            ),
        }
    }
}

impl Drop for StdioProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

pub struct StdioChannel {
    stdin: ChildStdin,
    stderr: BufReader<ChildStderr>,
}

#[async_trait]
impl Channel for StdioChannel {
    async fn call(
        &mut self,
        arguments: &[String],
        stdin: Option<&str>,
    ) -> Result<Response, ChannelError> {
        let frame = protocol::encode_request(arguments, stdin)?;
        self.stdin.write_all(&frame).await?;
        self.stdin.flush().await?;

        let mut header = [0u8; 4];
        self.stderr.read_exact(&mut header).await?;
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_RESPONSE_LEN {
            return Err(ChannelError::Protocol(format!(
                "response of {len} bytes exceeds {MAX_RESPONSE_LEN}"
            )));
        }

        let mut payload = vec![0u8; len];
        self.stderr.read_exact(&mut payload).await?;
        Ok(protocol::decode_response(&payload))
    }
}
