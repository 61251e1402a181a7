//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.pop,
//! pgmq.metrics.

use crate::error::Result;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use sqlx::PgConnection;

/// A message taken from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

fn record(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Send a message on an open connection or transaction. Returns the message ID.
pub async fn send(
    conn: &mut PgConnection,
    queue_name: &str,
    payload: &serde_json::Value,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
        .bind(queue_name)
        .bind(payload)
        .fetch_one(conn)
        .await?;
    record(queue_name, "send");
    Ok(row.0)
}

/// Queue length read on an open connection or transaction.
pub async fn queue_length(conn: &mut PgConnection, queue_name: &str) -> Result<usize> {
    let row: (i64,) = sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
        .bind(queue_name)
        .fetch_one(conn)
        .await?;
    Ok(row.0.max(0) as usize)
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        record(queue_name, "create");
        Ok(())
    }

    /// Atomically read and delete the oldest message. Returns None if the
    /// queue is empty. Concurrent callers never receive the same message.
    pub async fn pop_from_queue(&self, queue_name: &str) -> Result<Option<PgmqMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.pop($1)")
        .bind(queue_name)
        .fetch_optional(self.pool())
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            message,
        });
        record(queue_name, if msg.is_some() { "pop" } else { "pop_empty" });
        Ok(msg)
    }

    /// Number of messages waiting in a queue.
    pub async fn queue_length(&self, queue_name: &str) -> Result<usize> {
        let mut conn = self.pool().acquire().await?;
        queue_length(&mut conn, queue_name).await
    }
}
