//! Broker interfaces: job queue, status store, and per-job result channel.
//!
//! Submitters, workers, and the streaming gateway share these through
//! `Arc<dyn _>`. Implementations must be safe for concurrent use by many
//! workers and many subscribers. Two implementations ship: [`memory`] for a
//! single process and [`crate::db`] for Postgres (pgmq + LISTEN/NOTIFY).

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

use crate::error::Result;
use crate::model::{Job, JobId, JobStatus, Outcome, QueueEntry, StatusRecord};

pub use memory::MemoryBroker;

/// Default time a finished job's status and outcome are retained.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(900);

/// Stream of outcomes published on one job's result channel.
pub type OutcomeStream = BoxStream<'static, Result<Outcome>>;

/// FIFO hand-off between submitters and workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append an entry. Durable once it returns (for durable implementations).
    /// Fails fast with `QueueFull` when a maximum depth is configured.
    async fn enqueue(&self, entry: &QueueEntry) -> Result<()>;

    /// Wait until an entry is available and take it. Each entry is observed
    /// by at most one caller.
    async fn dequeue(&self) -> Result<QueueEntry>;

    /// Number of entries waiting.
    async fn depth(&self) -> Result<usize>;
}

/// Durable last-known status per job.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Record a newly submitted job as pending.
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Forget a job whose submission did not go through.
    async fn discard(&self, id: JobId) -> Result<()>;

    /// Move a job between non-terminal states. Fails with
    /// `InvalidTransition` if the job is not currently in `from`.
    async fn transition(&self, id: JobId, from: JobStatus, to: JobStatus) -> Result<()>;

    /// Store the job's one outcome and its terminal status. Starts the
    /// retention window.
    async fn record_outcome(&self, id: JobId, status: JobStatus, outcome: &Outcome) -> Result<()>;

    /// Current record, or a `not_found` record when missing or expired.
    async fn get(&self, id: JobId) -> Result<StatusRecord>;

    /// Jobs that entered `running` before `cutoff` and have not finished.
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>>;
}

/// Ephemeral per-job publish/subscribe channel carrying at most one outcome.
#[async_trait]
pub trait ResultChannel: Send + Sync {
    /// Deliver the outcome to current subscribers. Nobody listening is not
    /// an error; late subscribers recover the outcome from the status store.
    async fn publish(&self, id: JobId, outcome: &Outcome) -> Result<()>;

    /// Subscribe to the job's channel.
    async fn subscribe(&self, id: JobId) -> Result<OutcomeStream>;
}
