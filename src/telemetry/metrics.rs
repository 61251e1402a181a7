//! Metric instrument factories for roam.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"roam"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for roam instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("roam")
}

/// Counter: number of jobs submitted.
/// Labels: `function`, `result` ("ok" | "queue_full" | "error").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("roam.jobs.submitted")
        .with_description("Number of jobs submitted")
        .build()
}

/// Counter: job status transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("roam.jobs.state_transitions")
        .with_description("Number of job status transitions")
        .build()
}

/// Counter: queue-level operations (send, pop, rejected).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("roam.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: result stream sessions by how they ended.
/// Labels: `result` ("ok" | "not_found" | "timeout" | "error" | "disconnected").
pub fn stream_sessions() -> Counter<u64> {
    meter()
        .u64_counter("roam.stream.sessions")
        .with_description("Number of result stream sessions")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("roam.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
