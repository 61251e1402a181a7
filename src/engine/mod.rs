//! Worker execution engine: submission, the worker pool, execution backends,
//! and stale-job reaping.

pub mod child;
pub mod control;
pub mod dispatch;
pub mod process;
pub mod reaper;
pub mod sandbox;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Outcome, QueueEntry};

pub use control::{WorkerConfig, WorkerPool};
pub use dispatch::Dispatcher;
pub use process::ProcessBackend;
pub use reaper::Reaper;
pub use sandbox::{HttpSandboxApi, SandboxApi, SandboxBackend};

/// Runs one payload in isolation and reports its outcome.
///
/// Anything the payload does (errors, panics, timeouts, crashes) comes back
/// as an `Ok` outcome. `Err` is reserved for infrastructure faults such as a
/// binary that cannot be spawned or an unreachable orchestration API.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(&self, entry: &QueueEntry) -> Result<Outcome>;
}
