//! pgmq job queue and LISTEN/NOTIFY result channel.

use async_trait::async_trait;
use futures_util::stream;
use sqlx::postgres::PgListener;
use tracing::{debug, error, warn};

use super::{Db, READY_CHANNEL, pgmq};
use crate::broker::{JobQueue, OutcomeStream, ResultChannel, StatusStore};
use crate::error::{Error, Result};
use crate::model::{JobId, JobStatus, Outcome, QueueEntry};

/// Advisory lock key serializing depth-checked enqueues.
const ENQUEUE_LOCK: i64 = 0x726f_616d_0001;

#[async_trait]
impl JobQueue for Db {
    /// Queue the entry and wake listening workers in one transaction.
    async fn enqueue(&self, entry: &QueueEntry) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        if let Some(max) = self.max_depth {
            // Released at commit or rollback.
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(ENQUEUE_LOCK)
                .execute(&mut *tx)
                .await?;
            let depth = pgmq::queue_length(&mut tx, &self.queue).await?;
            if depth >= max {
                return Err(Error::QueueFull { depth });
            }
        }

        let msg_id = pgmq::send(&mut tx, &self.queue, &serde_json::to_value(entry)?).await?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(READY_CHANNEL)
            .bind(entry.job_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(job_id = %entry.job_id, msg_id, "job queued");
        Ok(())
    }

    async fn dequeue(&self) -> Result<QueueEntry> {
        let mut listener = self.checkout_listener().await?;
        let entry = self.next_entry(&mut listener).await;
        // A cancelled dequeue drops its listener instead of returning it.
        self.listeners.lock().await.push(listener);
        entry
    }

    async fn depth(&self) -> Result<usize> {
        self.queue_length(&self.queue).await
    }
}

impl Db {
    async fn checkout_listener(&self) -> Result<PgListener> {
        if let Some(listener) = self.listeners.lock().await.pop() {
            return Ok(listener);
        }
        let mut listener = PgListener::connect_with(self.pool()).await?;
        listener.listen(READY_CHANNEL).await?;
        debug!("opened job wake-up listener");
        Ok(listener)
    }

    async fn next_entry(&self, listener: &mut PgListener) -> Result<QueueEntry> {
        loop {
            if let Some(msg) = self.pop_from_queue(&self.queue).await? {
                match serde_json::from_value::<QueueEntry>(msg.message.clone()) {
                    Ok(entry) => return Ok(entry),
                    Err(e) => {
                        self.reject_undecodable(msg.msg_id, &msg.message, &e).await;
                        continue;
                    }
                }
            }

            // Wait for: notification, or poll timeout
            tokio::select! {
                notif = listener.recv() => {
                    if let Err(e) = notif {
                        warn!("PgListener error: {e}, falling back to poll");
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// A popped message that is not a queue entry. Fail its job if the id is
    /// recoverable so nobody waits on it.
    async fn reject_undecodable(
        &self,
        msg_id: i64,
        message: &serde_json::Value,
        err: &serde_json::Error,
    ) {
        error!(msg_id, "dropping undecodable queue entry: {err}");
        let Some(job_id) = message
            .get("job_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<JobId>().ok())
        else {
            return;
        };
        let outcome = Outcome::infrastructure(format!("undecodable queue entry: {err}"));
        if let Err(e) = self
            .record_outcome(job_id, JobStatus::Failed, &outcome)
            .await
        {
            warn!(%job_id, "could not fail undecodable job: {e}");
            return;
        }
        if let Err(e) = self.publish(job_id, &outcome).await {
            warn!(%job_id, "could not publish undecodable job failure: {e}");
        }
    }
}

#[async_trait]
impl ResultChannel for Db {
    /// The notification carries only the job id. Subscribers read the
    /// outcome from the jobs table, which is written before this is called.
    async fn publish(&self, id: JobId, _outcome: &Outcome) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(id.channel_name())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// LISTEN is active when this returns.
    async fn subscribe(&self, id: JobId) -> Result<OutcomeStream> {
        let mut listener = PgListener::connect_with(self.pool()).await?;
        listener.listen(&id.channel_name()).await?;

        let db = self.clone();
        let stream = stream::unfold(Some((listener, db)), move |state| async move {
            let (mut listener, db) = state?;
            loop {
                if let Err(e) = listener.recv().await {
                    return Some((Err(Error::from(e)), None));
                }
                match db.get(id).await {
                    Ok(record) => {
                        if let Some(outcome) = record.terminal_outcome() {
                            return Some((Ok(outcome.clone()), None));
                        }
                        // Stray notification before the outcome landed.
                        continue;
                    }
                    Err(e) => return Some((Err(e), None)),
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
