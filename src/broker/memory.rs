//! In-process broker built on tokio primitives.
//!
//! Implements all three broker interfaces for a single process. Nothing
//! survives a restart; use the Postgres broker when jobs must be durable or
//! workers run in other processes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{Mutex, Notify, broadcast};
use tracing::debug;

use super::{DEFAULT_RETENTION, JobQueue, OutcomeStream, ResultChannel, StatusStore};
use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobStatus, Outcome, QueueEntry, StatusRecord};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Single-process queue, status store, and result channels.
pub struct MemoryBroker {
    queue: Mutex<VecDeque<QueueEntry>>,
    ready: Notify,
    max_depth: Option<usize>,
    records: Mutex<HashMap<JobId, StoredRecord>>,
    retention: Duration,
    channels: Arc<Channels>,
}

struct StoredRecord {
    record: StatusRecord,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredRecord {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Channels {
    senders: StdMutex<HashMap<JobId, broadcast::Sender<Outcome>>>,
}

impl Channels {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, broadcast::Sender<Outcome>>> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Unbounded queue, default retention.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            max_depth: None,
            records: Mutex::new(HashMap::new()),
            retention: DEFAULT_RETENTION,
            channels: Arc::new(Channels::default()),
        }
    }

    /// Make `enqueue` fail with `QueueFull` once `depth` entries are waiting.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// How long finished records stay readable.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Number of live result channels (for diagnostics and tests).
    pub fn open_channels(&self) -> usize {
        self.channels.lock().len()
    }
}

fn record_queue_op(operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", "memory"),
            KeyValue::new("operation", operation),
        ],
    );
}

#[async_trait]
impl JobQueue for MemoryBroker {
    async fn enqueue(&self, entry: &QueueEntry) -> Result<()> {
        let mut queue = self.queue.lock().await;
        if let Some(max) = self.max_depth {
            if queue.len() >= max {
                record_queue_op("rejected");
                return Err(Error::QueueFull { depth: queue.len() });
            }
        }
        queue.push_back(entry.clone());
        drop(queue);
        self.ready.notify_one();
        record_queue_op("send");
        Ok(())
    }

    async fn dequeue(&self) -> Result<QueueEntry> {
        loop {
            // Register interest before checking so a concurrent enqueue's
            // notification cannot be missed.
            let notified = self.ready.notified();
            if let Some(entry) = self.queue.lock().await.pop_front() {
                record_queue_op("pop");
                return Ok(entry);
            }
            notified.await;
        }
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self.queue.lock().await.len())
    }
}

#[async_trait]
impl StatusStore for MemoryBroker {
    async fn insert(&self, job: &Job) -> Result<()> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        records.retain(|_, r| !r.expired(now));
        records.insert(
            job.id,
            StoredRecord {
                record: StatusRecord::pending(job),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn discard(&self, id: JobId) -> Result<()> {
        self.records.lock().await.remove(&id);
        Ok(())
    }

    async fn transition(&self, id: JobId, from: JobStatus, to: JobStatus) -> Result<()> {
        if !from.can_transition_to(to) || to.is_terminal() {
            return Err(Error::InvalidTransition { from, to });
        }
        let mut records = self.records.lock().await;
        let stored = records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        if stored.record.status != from {
            return Err(Error::InvalidTransition {
                from: stored.record.status,
                to,
            });
        }
        stored.record.status = to;
        if to == JobStatus::Running {
            stored.record.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_outcome(&self, id: JobId, status: JobStatus, outcome: &Outcome) -> Result<()> {
        let mut records = self.records.lock().await;
        let stored = records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        let from = stored.record.status;
        if !status.is_terminal() || !from.can_transition_to(status) {
            return Err(Error::InvalidTransition { from, to: status });
        }
        let now = Utc::now();
        stored.record.status = status;
        stored.record.finished_at = Some(now);
        stored.record.outcome = Some(outcome.clone());
        stored.expires_at = chrono::Duration::from_std(self.retention)
            .ok()
            .map(|r| now + r);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<StatusRecord> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let expired = match records.get(&id) {
            Some(stored) if !stored.expired(now) => return Ok(stored.record.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            records.remove(&id);
        }
        Ok(StatusRecord::not_found(id))
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| r.record.status == JobStatus::Running)
            .filter(|r| r.record.started_at.is_some_and(|at| at < cutoff))
            .map(|r| r.record.job_id)
            .collect())
    }
}

#[async_trait]
impl ResultChannel for MemoryBroker {
    async fn publish(&self, id: JobId, outcome: &Outcome) -> Result<()> {
        // The channel carries exactly one outcome, so it is torn down here.
        // Receivers still drain the buffered message before seeing Closed.
        let sender = self.channels.lock().remove(&id);
        match sender {
            Some(tx) => {
                let delivered = tx.send(outcome.clone()).unwrap_or(0);
                debug!(job_id = %id, delivered, "outcome published");
            }
            None => debug!(job_id = %id, "outcome published with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self, id: JobId) -> Result<OutcomeStream> {
        let rx = {
            let mut senders = self.channels.lock();
            senders
                .entry(id)
                .or_insert_with(|| broadcast::channel(1).0)
                .subscribe()
        };
        let subscription = Subscription {
            rx: Some(rx),
            channels: Arc::clone(&self.channels),
            id,
        };

        let stream = futures_util::stream::unfold(subscription, |mut sub| async move {
            let rx = sub.rx.as_mut()?;
            loop {
                match rx.recv().await {
                    Ok(outcome) => return Some((Ok(outcome), sub)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Receiver that removes its channel when the last subscriber goes away.
struct Subscription {
    rx: Option<broadcast::Receiver<Outcome>>,
    channels: Arc<Channels>,
    id: JobId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.rx.take());
        let mut senders = self.channels.lock();
        if senders
            .get(&self.id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            senders.remove(&self.id);
        }
    }
}
