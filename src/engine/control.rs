//! Worker pool: dequeue jobs, run them through the execution backend,
//! record and publish each outcome.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::ExecutionBackend;
use crate::broker::{JobQueue, ResultChannel, StatusStore};
use crate::error::{Error, Result};
use crate::model::{JobId, JobStatus, Outcome, QueueEntry};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of independent execution loops.
    pub workers: usize,
    /// Pause after a failed dequeue before trying again.
    pub dequeue_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            dequeue_backoff: Duration::from_secs(1),
        }
    }
}

/// A pool of execution loops sharing the broker and one backend.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn StatusStore>,
    channel: Arc<dyn ResultChannel>,
    backend: Arc<dyn ExecutionBackend>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn StatusStore>,
        channel: Arc<dyn ResultChannel>,
        backend: Arc<dyn ExecutionBackend>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            channel,
            backend,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Signal every loop to stop after its current job.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run all loops until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut loops = JoinSet::new();
        for worker in 0..self.config.workers.max(1) {
            let pool = self.clone();
            loops.spawn(async move { pool.run_loop(worker).await });
        }
        info!(workers = self.config.workers.max(1), "worker pool started");

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!("worker loop aborted: {e}");
            }
        }
        info!("worker pool stopped");
        Ok(())
    }

    /// One execution loop: blocking dequeue, then bounded-time execution.
    async fn run_loop(&self, worker: usize) {
        loop {
            let entry = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(worker, "worker loop shutting down");
                    return;
                }
                entry = self.queue.dequeue() => entry,
            };

            match entry {
                Ok(entry) => self.process_job(worker, entry).await,
                Err(e) => {
                    warn!(worker, "dequeue failed: {e}, backing off");
                    tokio::time::sleep(self.config.dequeue_backoff).await;
                }
            }
        }
    }

    /// Execute one job. Never fails: every error is logged here or turned
    /// into the job's outcome.
    async fn process_job(&self, worker: usize, entry: QueueEntry) {
        let job_id = entry.job_id;
        let span = start_job_span(&entry.payload.function, &job_id, worker);

        async {
            match self
                .store
                .transition(job_id, JobStatus::Pending, JobStatus::Running)
                .await
            {
                Ok(()) => {}
                Err(e @ (Error::InvalidTransition { .. } | Error::NotFound(_))) => {
                    warn!(%job_id, "cannot mark job running, skipping: {e}");
                    return;
                }
                Err(e) => {
                    // The entry is already off the queue; fail the job so
                    // callers get an answer.
                    error!(%job_id, "cannot mark job running: {e}");
                    let outcome = Outcome::infrastructure(e);
                    if finish(
                        self.store.as_ref(),
                        self.channel.as_ref(),
                        job_id,
                        JobStatus::Pending,
                        JobStatus::Failed,
                        &outcome,
                    )
                    .await
                    {
                        record_state_transition(&span, JobStatus::Pending, JobStatus::Failed);
                    }
                    return;
                }
            }
            record_state_transition(&span, JobStatus::Pending, JobStatus::Running);

            let outcome = match self.backend.execute(&entry).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(%job_id, "execution backend failed: {e}");
                    Outcome::infrastructure(e)
                }
            };
            let status = outcome.status();

            metrics::operation_duration_ms().record(
                outcome.duration_ms as f64,
                &[KeyValue::new("operation", "job.execute")],
            );

            match status {
                JobStatus::Completed => info!(%job_id, duration_ms = outcome.duration_ms, "job completed"),
                _ => warn!(
                    %job_id,
                    %status,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    duration_ms = outcome.duration_ms,
                    "job did not complete"
                ),
            }

            finish(
                self.store.as_ref(),
                self.channel.as_ref(),
                job_id,
                JobStatus::Running,
                status,
                &outcome,
            )
            .await;
            record_state_transition(&span, JobStatus::Running, status);
        }
        .instrument(span.clone())
        .await
    }
}

/// Store the outcome, then publish it. The store is written first so a
/// subscriber that checks it after subscribing cannot miss the outcome.
pub(crate) async fn finish(
    store: &dyn StatusStore,
    channel: &dyn ResultChannel,
    job_id: JobId,
    from: JobStatus,
    status: JobStatus,
    outcome: &Outcome,
) -> bool {
    match store.record_outcome(job_id, status, outcome).await {
        Ok(()) => {}
        Err(Error::InvalidTransition { .. }) => {
            warn!(%job_id, %from, to = %status, "job already finished elsewhere, outcome dropped");
            return false;
        }
        Err(e) => error!(%job_id, "failed to store outcome: {e}"),
    }
    if let Err(e) = channel.publish(job_id, outcome).await {
        error!(%job_id, "failed to publish outcome: {e}");
    }
    true
}
