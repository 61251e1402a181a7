//! Local child-process execution backend.
//!
//! Spawns the `roam` binary in `exec` mode for every job, pipes the payload
//! to its stdin, captures stdout/stderr, and enforces a hard wall-clock
//! timeout. On expiry the child is killed and reaped before returning.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::ExecutionBackend;
use super::child::parse_output;
use crate::error::{Error, Result};
use crate::model::{FailureKind, Outcome, QueueEntry};

/// Default timeout for inline execution.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

/// Runs each payload in a fresh child process.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessBackend {
    /// `program` must understand the `exec` subcommand (the `roam` binary,
    /// or any binary that calls [`super::child::run`]).
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["exec".to_string()],
            timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    /// Re-execute the currently running binary.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn execute(&self, entry: &QueueEntry) -> Result<Outcome> {
        let input = serde_json::to_vec(&entry.payload)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("ROAM_JOB_ID", entry.job_id.to_string())
            .env_remove(super::child::PAYLOAD_ENV)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            Error::Infrastructure(format!("cannot spawn {}: {e}", self.program.display()))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The child may exit without reading; a broken pipe is not our failure.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(job_id = %entry.job_id, "payload write to child failed: {e}");
            }
            drop(stdin);
        }

        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), "stdout", MAX_OUTPUT_BYTES));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), "stderr", MAX_OUTPUT_BYTES));

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let status = match waited {
            Ok(status) => Some(status?),
            Err(_elapsed) => {
                // Kill and reap so no process outlives the job.
                if let Err(e) = child.kill().await {
                    warn!(job_id = %entry.job_id, "failed to kill timed-out child: {e}");
                }
                None
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = captured(stdout_task.await, "stdout");
        let stderr = captured(stderr_task.await, "stderr");
        let notices: Vec<String> = [stdout.notice, stderr.notice].into_iter().flatten().collect();
        let stdout = String::from_utf8_lossy(&stdout.bytes).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.bytes).into_owned();

        let mut outcome = match status {
            None => Outcome::failure(
                FailureKind::Timeout,
                format!("execution exceeded the {}s timeout", self.timeout.as_secs_f64()),
            )
            .with_stdout(stdout),
            Some(status) => interpret_exit(status.code(), &stdout, &stderr),
        };
        attach_notices(&mut outcome, &notices);
        if !notices.is_empty() {
            warn!(job_id = %entry.job_id, ?notices, "child output was not captured in full");
        }
        outcome.duration_ms = duration_ms;
        Ok(outcome)
    }
}

/// Build the outcome of a child that exited on its own.
///
/// A parseable outcome line wins regardless of exit status. Without one, a
/// clean exit and a non-zero exit are reported as different causes.
pub fn interpret_exit(code: Option<i32>, stdout: &str, stderr: &str) -> Outcome {
    let stderr = (!stderr.is_empty()).then(|| stderr.to_string());

    if let Some((user_stdout, mut outcome)) = parse_output(stdout) {
        outcome.stdout = user_stdout;
        outcome.stderr = stderr;
        return outcome;
    }

    let mut outcome = match code {
        Some(0) => Outcome::failure(
            FailureKind::UnparseableOutput,
            "failed to parse execution result",
        ),
        Some(code) => Outcome::failure(
            FailureKind::ProcessExit,
            format!("process exited with status {code}"),
        ),
        None => Outcome::failure(FailureKind::ProcessExit, "process was terminated by a signal"),
    };
    outcome.stdout = stdout.to_string();
    outcome.trace = stderr.clone();
    outcome.stderr = stderr;
    outcome
}

/// Bytes read from one child stream, plus what went wrong reading it.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    notice: Option<String>,
}

fn captured(joined: std::result::Result<Captured, tokio::task::JoinError>, name: &str) -> Captured {
    joined.unwrap_or_else(|e| Captured {
        bytes: Vec::new(),
        notice: Some(format!("[roam] {name} reader failed: {e}")),
    })
}

/// Keep the first `limit` bytes of a stream. The rest is drained so the
/// child never writes into a closed pipe.
async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>, name: &str, limit: u64) -> Captured {
    let mut captured = Captured::default();
    let Some(mut h) = handle else {
        return captured;
    };
    let read = match (&mut h).take(limit).read_to_end(&mut captured.bytes).await {
        Ok(_) => tokio::io::copy(&mut h, &mut tokio::io::sink()).await,
        Err(e) => Err(e),
    };
    captured.notice = match read {
        Ok(0) => None,
        Ok(dropped) => Some(format!(
            "[roam] {name} truncated at {limit} bytes, {dropped} more bytes dropped"
        )),
        Err(e) => Some(format!("[roam] reading {name} failed: {e}")),
    };
    captured
}

/// Surface capture problems in stderr, and in the trace of a failed job.
fn attach_notices(outcome: &mut Outcome, notices: &[String]) {
    if notices.is_empty() {
        return;
    }
    let text = notices.join("\n");
    let append = |field: &mut Option<String>| match field {
        Some(existing) if !existing.is_empty() => {
            existing.push('\n');
            existing.push_str(&text);
        }
        _ => *field = Some(text.clone()),
    };
    append(&mut outcome.stderr);
    if !outcome.success {
        append(&mut outcome.trace);
    }
}
