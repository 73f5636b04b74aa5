//! Subprocess execution for external pipeline tooling.
//!
//! [`ProcessRunner::run`] spawns a command through a shell, captures its
//! output, and resolves once with either the decoded stdout or an
//! [`ExecError`]. Cancellation is expressed only through
//! [`ExecOptions::timeout`]: the child is killed when the deadline passes.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (10 MiB).
///
/// Output exceeding this limit is truncated to prevent memory exhaustion
/// from extremely verbose tools.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Shell used when [`ExecOptions::shell`] is not set.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Options applied to a single subprocess invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory for the child process (inherits ours if `None`).
    pub cwd: Option<PathBuf>,
    /// Additional environment variables set for the child process.
    pub env: Vec<(String, String)>,
    /// Maximum wall-clock time before the process is killed.
    pub timeout: Option<Duration>,
    /// Shell that interprets the command (`<shell> -c <command>`).
    pub shell: Option<String>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }
}

/// Why a subprocess did not produce a successful result.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The process could not be spawned or its exit status not collected.
    #[error("Failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),

    /// The process exited unsuccessfully.
    #[error("Process exited with {}: {stderr}", describe_exit(.code, .signal))]
    Exit {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Terminating signal, if the process was killed by one.
        signal: Option<i32>,
        /// Captured stderr output.
        stderr: String,
    },

    /// The process exceeded its timeout and was killed.
    #[error("Process timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".to_string(),
    }
}

/// Runs shell commands as subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Run `command` and return its stdout on a zero exit status.
    pub async fn run(&self, command: &str, options: ExecOptions) -> Result<String, ExecError> {
        let shell = options.shell.as_deref().unwrap_or(DEFAULT_SHELL);
        let mut cmd = Command::new(shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &options.cwd {
            cmd.current_dir(dir);
        }

        tracing::debug!(command, shell, cwd = ?options.cwd, "Spawning process");
        let start = Instant::now();
        let mut child = cmd.spawn()?;

        // Drain both pipes in their own tasks so `child.wait()` can borrow
        // the child and a chatty process never blocks on a full pipe.
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();
        let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
        let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

        let status = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_elapsed) => {
                    // `child` is dropped on return, which kills it (`kill_on_drop`).
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    tracing::warn!(command, elapsed_ms, "Process timed out");
                    return Err(ExecError::Timeout { elapsed_ms });
                }
            },
            None => child.wait().await?,
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

        if status.success() {
            tracing::debug!(
                command,
                duration_ms = start.elapsed().as_millis() as u64,
                "Process completed",
            );
            Ok(stdout)
        } else {
            Err(ExecError::Exit {
                code: status.code(),
                signal: exit_signal(&status),
                stderr,
            })
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
