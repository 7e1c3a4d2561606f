//! Long-lived helper subprocesses (actuator bridge, audio player).
//!
//! Each child runs with piped stdio. Its stdout and stderr lines are
//! forwarded to the log, and the caller owns the stdin writer.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors from subprocess operations.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Empty command line")]
    EmptyCommand,

    #[error("Failed to spawn {name}: {reason}")]
    SpawnFailed { name: String, reason: String },
}

/// A spawned child process with graceful termination.
pub struct ManagedChild {
    name: String,
    child: Mutex<Option<Child>>,
    terminate_timeout: Duration,
}

impl ManagedChild {
    /// Spawn `program args..` and return the child plus its stdin.
    pub fn spawn(
        name: &str,
        program: &str,
        args: &[String],
        terminate_timeout: Duration,
    ) -> Result<(Self, ChildStdin), SubprocessError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(name, program, ?args, "Spawning subprocess");
        let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| SubprocessError::SpawnFailed {
            name: name.to_string(),
            reason: "Failed to capture stdin".to_string(),
        })?;

        if let Some(stdout) = child.stdout.take() {
            let label = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(process = %label, "stdout: {}", line);
                }
                debug!(process = %label, "stdout reader finished");
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let label = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(process = %label, "stderr: {}", line);
                }
                debug!(process = %label, "stderr reader finished");
            });
        }

        Ok((
            Self {
                name: name.to_string(),
                child: Mutex::new(Some(child)),
                terminate_timeout,
            },
            stdin,
        ))
    }

    /// Spawn a whitespace-separated command line.
    pub fn spawn_command_line(
        name: &str,
        command_line: &str,
        terminate_timeout: Duration,
    ) -> Result<(Self, ChildStdin), SubprocessError> {
        let mut parts = command_line.split_whitespace().map(str::to_owned);
        let program = parts.next().ok_or(SubprocessError::EmptyCommand)?;
        let args: Vec<String> = parts.collect();
        Self::spawn(name, &program, &args, terminate_timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the child is still alive.
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return false;
        };
        matches!(child.try_wait(), Ok(None))
    }

    /// Wait for the child to exit on its own (stdin should already be
    /// closed), killing it after the timeout.
    pub async fn terminate(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => info!(process = %self.name, ?status, "Subprocess exited"),
            Ok(Err(e)) => {
                warn!(process = %self.name, error = %e, "Error waiting for subprocess");
                child.kill().await.ok();
            }
            Err(_) => {
                warn!(process = %self.name, "Timeout waiting for subprocess, killing");
                child.kill().await.ok();
            }
        }
    }
}
