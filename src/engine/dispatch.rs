//! Job submission and status lookup.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::broker::{JobQueue, StatusStore};
use crate::error::{Error, Result};
use crate::model::{Job, JobId, StatusRecord};
use crate::payload::{ENCODING_VERSION, Payload};
use crate::telemetry::metrics;

/// Front door for submitters. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn StatusStore>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn JobQueue>, store: Arc<dyn StatusStore>) -> Self {
        Self { queue, store }
    }

    /// Submit a payload. The pending record is written before the entry is
    /// queued, so a worker never dequeues a job the store does not know. If
    /// queueing fails the record is discarded and no job id escapes.
    pub async fn submit(&self, payload: Payload) -> Result<Job> {
        if payload.version != ENCODING_VERSION {
            return Err(Error::UnsupportedEncoding {
                found: payload.version,
                expected: ENCODING_VERSION,
            });
        }

        let job = Job::new(payload);
        let function = job.payload.function.clone();
        self.store.insert(&job).await?;

        if let Err(e) = self.queue.enqueue(&job.queue_entry()).await {
            if let Err(discard) = self.store.discard(job.id).await {
                warn!(job_id = %job.id, "failed to discard unqueued job: {discard}");
            }
            let result = match e {
                Error::QueueFull { .. } => "queue_full",
                _ => "error",
            };
            metrics::jobs_submitted().add(
                1,
                &[
                    KeyValue::new("function", function),
                    KeyValue::new("result", result),
                ],
            );
            return Err(e);
        }

        metrics::jobs_submitted().add(
            1,
            &[
                KeyValue::new("function", function.clone()),
                KeyValue::new("result", "ok"),
            ],
        );
        info!(job_id = %job.id, function = %function, "job submitted");
        Ok(job)
    }

    /// Last-known status of a job.
    pub async fn status(&self, id: JobId) -> Result<StatusRecord> {
        self.store.get(id).await
    }

    /// Number of jobs waiting for a worker.
    pub async fn queue_depth(&self) -> Result<usize> {
        self.queue.depth().await
    }
}
