//! Fails jobs whose worker disappeared mid-execution.
//!
//! A job is leased to its worker by the `running` status. When a worker dies
//! the status never moves again, so any job still `running` well past the
//! longest execution timeout is declared lost. Lost jobs are not requeued:
//! the function may have had side effects.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::control::finish;
use crate::broker::{ResultChannel, StatusStore};
use crate::error::{Error, Result};
use crate::model::{JobStatus, Outcome};

pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Reaper {
    store: Arc<dyn StatusStore>,
    channel: Arc<dyn ResultChannel>,
    stale_after: Duration,
    interval: Duration,
    shutdown: CancellationToken,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn StatusStore>,
        channel: Arc<dyn ResultChannel>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            channel,
            stale_after,
            interval: DEFAULT_REAP_INTERVAL,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Sweep on a fixed interval until shutdown.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.reap_once().await {
                Ok(0) => debug!("no stale jobs"),
                Ok(n) => info!(reaped = n, "failed stale jobs"),
                Err(e) => warn!("stale job sweep failed: {e}"),
            }
        }
    }

    /// One sweep. Returns how many jobs were failed.
    pub async fn reap_once(&self) -> Result<usize> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| Error::Config(format!("stale_after out of range: {e}")))?;
        let cutoff = Utc::now() - stale_after;

        let mut reaped = 0;
        for job_id in self.store.list_stale(cutoff).await? {
            let outcome = Outcome::infrastructure(format!(
                "worker lost: job still running after {}s",
                self.stale_after.as_secs()
            ));
            warn!(%job_id, "job lease expired, marking failed");
            if finish(
                self.store.as_ref(),
                self.channel.as_ref(),
                job_id,
                JobStatus::Running,
                JobStatus::Failed,
                &outcome,
            )
            .await
            {
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}
