//! Streaming gateway: turns one job's result channel into an ordered event
//! stream for a single waiting caller.
//!
//! Every session emits `connected` first and ends with exactly one of
//! `result` + `complete` or `error`. The channel is subscribed before the
//! status store is checked, so an outcome published between the two is
//! still seen, and an outcome published before the caller connected is
//! recovered from the store.

pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::broker::{ResultChannel, StatusStore};
use crate::model::{JobId, JobStatus, Outcome};
use crate::telemetry::metrics;

pub use routes::{AppState, router};

/// One event on a job's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected { job_id: JobId },
    Result { data: Outcome },
    Complete,
    Error { error: String },
}

impl StreamEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, StreamEvent::Complete | StreamEvent::Error { .. })
    }
}

/// Produce the event sequence for one caller waiting on `job_id`.
///
/// `wait` bounds how long the session waits for a live outcome before
/// giving up with an `error` event. The job itself keeps running.
pub fn job_events(
    job_id: JobId,
    store: Arc<dyn StatusStore>,
    channel: Arc<dyn ResultChannel>,
    wait: Duration,
) -> ReceiverStream<StreamEvent> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let result = run_session(job_id, store.as_ref(), channel.as_ref(), wait, &tx).await;
        metrics::stream_sessions().add(1, &[KeyValue::new("result", result)]);
    });
    ReceiverStream::new(rx)
}

async fn run_session(
    job_id: JobId,
    store: &dyn StatusStore,
    channel: &dyn ResultChannel,
    wait: Duration,
    tx: &mpsc::Sender<StreamEvent>,
) -> &'static str {
    // A send error means the caller disconnected; stop quietly.
    if tx.send(StreamEvent::Connected { job_id }).await.is_err() {
        return "disconnected";
    }

    let mut subscription = match channel.subscribe(job_id).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%job_id, "subscription failed: {e}");
            let _ = tx
                .send(StreamEvent::Error {
                    error: format!("subscription failed: {e}"),
                })
                .await;
            return "error";
        }
    };

    let record = match store.get(job_id).await {
        Ok(r) => r,
        Err(e) => {
            let _ = tx
                .send(StreamEvent::Error {
                    error: format!("status lookup failed: {e}"),
                })
                .await;
            return "error";
        }
    };

    if record.status == JobStatus::NotFound {
        let _ = tx
            .send(StreamEvent::Error {
                error: format!("job {job_id} not found"),
            })
            .await;
        return "not_found";
    }

    if let Some(outcome) = record.terminal_outcome() {
        debug!(%job_id, "outcome already stored");
        return deliver(tx, outcome.clone()).await;
    }

    match tokio::time::timeout(wait, subscription.next()).await {
        Ok(Some(Ok(outcome))) => deliver(tx, outcome).await,
        Ok(Some(Err(e))) => {
            let _ = tx
                .send(StreamEvent::Error {
                    error: format!("result channel failed: {e}"),
                })
                .await;
            "error"
        }
        Ok(None) => {
            let _ = tx
                .send(StreamEvent::Error {
                    error: "result channel closed without an outcome".to_string(),
                })
                .await;
            "error"
        }
        Err(_elapsed) => {
            let _ = tx
                .send(StreamEvent::Error {
                    error: format!("no outcome within {}s", wait.as_secs()),
                })
                .await;
            "timeout"
        }
    }
}

async fn deliver(tx: &mpsc::Sender<StreamEvent>, outcome: Outcome) -> &'static str {
    if tx.send(StreamEvent::Result { data: outcome }).await.is_err() {
        return "disconnected";
    }
    let _ = tx.send(StreamEvent::Complete).await;
    "ok"
}
