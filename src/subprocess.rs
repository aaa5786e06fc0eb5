//! Retrying subprocess execution for external converters.
//!
//! Converter tools (notebook kernels, PlantUML, draw.io) hang or crash on
//! their own schedule. [`SubprocessRunner`] runs one command line with:
//! - a timeout that doubles on every timed-out attempt
//! - SIGTERM, a grace period, then a hard kill for a timed-out child
//! - optional retry of non-zero exits after a fixed delay
//! - captured and truncated stdout/stderr

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SubprocessError;

/// Maximum captured size per stream before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Retry behaviour for one command.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts.
    pub max_retries: u32,
    /// Timeout of the first attempt; doubled on each timed-out attempt.
    pub base_timeout: Duration,
    /// Retry non-zero exits as well as timeouts.
    pub crash_retry: bool,
    /// Pause before retrying a crashed attempt.
    pub crash_delay: Duration,
    /// Time between SIGTERM and the hard kill.
    pub terminate_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_timeout: Duration::from_secs(60),
            crash_retry: false,
            crash_delay: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Policy for tools that crash transiently (draw.io's Electron runtime).
    pub fn crash_tolerant() -> Self {
        Self {
            crash_retry: true,
            crash_delay: Duration::from_secs(2),
            ..Self::default()
        }
    }

    pub fn with_base_timeout(mut self, timeout: Duration) -> Self {
        self.base_timeout = timeout;
        self
    }

    /// Timeout after `timeouts` timed-out attempts.
    pub fn timeout_after(&self, timeouts: u32) -> Duration {
        let factor = 1u32 << timeouts.min(16);
        self.base_timeout.saturating_mul(factor)
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct Output {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Runs external commands with the retry policy applied.
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner {
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

enum Attempt {
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut,
}

impl SubprocessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable for every spawned child.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run `command` (program followed by its arguments).
    pub async fn run(
        &self,
        command: &[String],
        policy: &RetryPolicy,
    ) -> Result<Output, SubprocessError> {
        let (program, args) = command.split_first().ok_or(SubprocessError::EmptyCommand)?;
        let max_attempts = policy.max_retries.max(1);
        let mut last_exit: Option<(Option<i32>, String)> = None;
        let mut timeouts = 0;

        for attempt in 1..=max_attempts {
            let timeout = policy.timeout_after(timeouts);
            debug!(program, attempt, ?timeout, "Running subprocess");

            match self.attempt(program, args, timeout, policy).await? {
                Attempt::Exited {
                    code: Some(0),
                    stdout,
                    stderr,
                } => {
                    return Ok(Output {
                        exit_code: 0,
                        stdout,
                        stderr,
                        attempts: attempt,
                    });
                }
                Attempt::Exited { code, stderr, .. } => {
                    if !policy.crash_retry {
                        return Err(SubprocessError::Failed {
                            program: program.clone(),
                            exit_code: code,
                            stderr,
                            attempts: attempt,
                        });
                    }
                    warn!(
                        program,
                        attempt,
                        max_attempts,
                        exit_code = ?code,
                        "Subprocess crashed, retrying"
                    );
                    last_exit = Some((code, stderr));
                    if attempt < max_attempts {
                        tokio::time::sleep(policy.crash_delay).await;
                    }
                }
                Attempt::TimedOut => {
                    warn!(program, attempt, max_attempts, ?timeout, "Subprocess timed out");
                    last_exit = None;
                    timeouts += 1;
                }
            }
        }

        match last_exit {
            Some((exit_code, stderr)) => Err(SubprocessError::Failed {
                program: program.clone(),
                exit_code,
                stderr,
                attempts: max_attempts,
            }),
            None => Err(SubprocessError::Timeout {
                program: program.clone(),
                timeout: policy.timeout_after(timeouts.saturating_sub(1)),
                attempts: max_attempts,
            }),
        }
    }

    async fn attempt(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<Attempt, SubprocessError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| SubprocessError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                Ok(Attempt::Exited {
                    code: status.code(),
                    stdout: join_capture(stdout).await,
                    stderr: join_capture(stderr).await,
                })
            }
            Err(_) => {
                terminate(&mut child, policy.terminate_grace).await;
                stdout.abort();
                stderr.abort();
                Ok(Attempt::TimedOut)
            }
        }
    }
}

fn capture<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return String::new();
        };
        let mut buf = Vec::new();
        if let Err(e) = stream.read_to_end(&mut buf).await {
            debug!("Output capture stopped: {e}");
        }
        truncate_output(&buf)
    })
}

async fn join_capture(handle: JoinHandle<String>) -> String {
    handle.await.unwrap_or_default()
}

fn truncate_output(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_OUTPUT_SIZE {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let half = MAX_OUTPUT_SIZE / 2;
    format!(
        "{}\n\n... [truncated {} bytes] ...\n\n{}",
        String::from_utf8_lossy(&bytes[..half]),
        bytes.len() - MAX_OUTPUT_SIZE,
        String::from_utf8_lossy(&bytes[bytes.len() - half..])
    )
}

/// Ask the child to stop, then force it after `grace`.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        send_sigterm(pid).await;
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            debug!(pid, ?status, "Process exited after SIGTERM");
            return;
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Process already gone: {e}");
    }
}

/// Deliver SIGTERM through the system `kill` utility.
pub(crate) async fn send_sigterm(pid: u32) {
    if !cfg!(unix) {
        return;
    }
    let result = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        debug!(pid, "kill -TERM failed: {e}");
    }
}
