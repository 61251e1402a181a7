//! Core data model.
//!
//! A job is a payload submitted for remote execution plus its lifecycle
//! status. An outcome is what exactly one execution of a job produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::Payload;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of submitted work tracked by the status store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: Payload,
    pub submitted_at: DateTime<Utc>,
    /// The only mutable field. Transitions are monotonic.
    pub status: JobStatus,
}

impl Job {
    /// A freshly submitted job, pending in the queue.
    pub fn new(payload: Payload) -> Self {
        Self {
            id: JobId::new(),
            payload,
            submitted_at: Utc::now(),
            status: JobStatus::Pending,
        }
    }

    /// The entry handed to the queue for this job.
    pub fn queue_entry(&self) -> QueueEntry {
        QueueEntry {
            job_id: self.id,
            payload: self.payload.clone(),
            submitted_at: self.submitted_at,
        }
    }
}

/// Queue wire format: one entry per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub payload: Payload,
    pub submitted_at: DateTime<Utc>,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic name of this job's result channel.
    pub fn channel_name(&self) -> String {
        format!("roam_result_{}", self.0.simple())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|_| crate::error::Error::NotFound(format!("job {s}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for a worker.
    Pending,
    /// Dequeued by exactly one worker, executing.
    Running,
    /// Executed and produced a successful outcome. Terminal.
    Completed,
    /// Executed (or could not be executed) and failed. Terminal.
    Failed,
    /// Killed after exceeding its execution timeout. Terminal.
    TimedOut,
    /// Never submitted, or its record expired. Only ever reported, never stored.
    NotFound,
}

impl JobStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Failed)     // undecodable entry or infrastructure fault
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::NotFound => "not_found",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "timed_out" => Ok(JobStatus::TimedOut),
            "not_found" => Ok(JobStatus::NotFound),
            other => Err(crate::error::Error::Other(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of exactly one execution of a job. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default)]
    pub return_value: Option<serde_json::Value>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Why the execution failed. None on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Failure causes, kept distinct to aid debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The function returned an error or panicked.
    UserError,
    /// The execution exceeded its wall-clock timeout.
    Timeout,
    /// The process exited cleanly but printed no parseable outcome line.
    UnparseableOutput,
    /// The process exited non-zero without a parseable outcome line.
    ProcessExit,
    /// Queue, broker, or orchestration failure outside the user's code.
    Infrastructure,
}

impl Outcome {
    pub fn success(return_value: serde_json::Value) -> Self {
        Self {
            success: true,
            return_value: Some(return_value),
            stdout: String::new(),
            error: None,
            trace: None,
            stderr: None,
            kind: None,
            duration_ms: 0,
        }
    }

    pub fn failure(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            return_value: None,
            stdout: String::new(),
            error: Some(error.into()),
            trace: None,
            stderr: None,
            kind: Some(kind),
            duration_ms: 0,
        }
    }

    /// Failure outcome for anything that went wrong outside the payload.
    pub fn infrastructure(error: impl std::fmt::Display) -> Self {
        Self::failure(FailureKind::Infrastructure, format!("infrastructure: {error}"))
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// The terminal status this outcome moves its job to.
    pub fn status(&self) -> JobStatus {
        if self.success {
            JobStatus::Completed
        } else if self.kind == Some(FailureKind::Timeout) {
            JobStatus::TimedOut
        } else {
            JobStatus::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// Status record
// ---------------------------------------------------------------------------

/// Last-known status of a job, as served to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    pub function: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
}

impl StatusRecord {
    /// Record for a job the store knows nothing about.
    pub fn not_found(job_id: JobId) -> Self {
        Self {
            job_id,
            status: JobStatus::NotFound,
            function: None,
            submitted_at: None,
            started_at: None,
            finished_at: None,
            outcome: None,
        }
    }

    pub fn pending(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: JobStatus::Pending,
            function: Some(job.payload.function.clone()),
            submitted_at: Some(job.submitted_at),
            started_at: None,
            finished_at: None,
            outcome: None,
        }
    }

    /// The stored outcome, if the job reached a terminal state.
    pub fn terminal_outcome(&self) -> Option<&Outcome> {
        if self.status.is_terminal() {
            self.outcome.as_ref()
        } else {
            None
        }
    }
}
