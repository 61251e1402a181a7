//! Job execution span helpers.
//!
//! Provides span creation and state-transition recording for jobs flowing
//! through the worker pool.

use tracing::Span;

use crate::model::{JobId, JobStatus};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Start a span for job execution.
///
/// The `job.status` field is declared empty and is filled in by
/// [`record_state_transition`].
pub fn start_job_span(function: &str, job_id: &JobId, worker: usize) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.function" = function,
        "job.id" = %job_id,
        "job.worker" = worker,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a status transition on the span and in the transition counter.
pub fn record_state_transition(span: &Span, from: JobStatus, to: JobStatus) {
    span.record("job.status", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
