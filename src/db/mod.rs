//! Postgres broker: connection pool, migrations, and health check.
//!
//! One `Db` implements all three broker interfaces. The `jobs` table is the
//! status store, a pgmq queue carries queue entries, and LISTEN/NOTIFY
//! carries wake-ups and result notifications.

pub mod jobs;
pub mod notify;
pub mod pgmq;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::Mutex;

use crate::broker::DEFAULT_RETENTION;
use crate::error::Result;

/// Default pgmq queue holding pending entries.
pub const JOB_QUEUE: &str = "roam_jobs";

/// NOTIFY channel signalled whenever an entry is queued.
pub const READY_CHANNEL: &str = "roam_jobs_ready";

/// Database handle. Owns the connection pool; cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
    queue: String,
    retention: Duration,
    max_depth: Option<usize>,
    poll_interval: Duration,
    /// Wake-up listeners not currently held by a dequeue.
    listeners: Arc<Mutex<Vec<PgListener>>>,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            queue: JOB_QUEUE.to_string(),
            retention: DEFAULT_RETENTION,
            max_depth: None,
            poll_interval: Duration::from_secs(5),
            listeners: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Use another pgmq queue for job entries.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// How long finished jobs stay readable.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Reject submissions once this many entries are waiting. The check and
    /// the send happen under one transaction-scoped lock, so the bound is exact.
    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    /// Fallback poll period for a blocked dequeue when no NOTIFY arrives.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run all pending migrations and make sure the job queue exists.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        self.create_queue(&self.queue).await
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Idle wake-up listeners kept for reuse by the next dequeue.
    pub async fn idle_listeners(&self) -> usize {
        self.listeners.lock().await.len()
    }
}
