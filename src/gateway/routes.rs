//! HTTP surface: job submission, SSE streaming, status polling, health.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use super::{StreamEvent, job_events};
use crate::broker::{ResultChannel, StatusStore};
use crate::engine::Dispatcher;
use crate::error::Error;
use crate::model::{JobId, JobStatus, Outcome};
use crate::payload::Payload;

/// Default bound on how long a stream waits for a live outcome.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(330);

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub store: Arc<dyn StatusStore>,
    pub channel: Arc<dyn ResultChannel>,
    pub stream_timeout: Duration,
}

/// Response to a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: JobId,
    pub stream_url: String,
}

/// Response to a status poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/health", get(health))
        .route("/job", post(submit_job))
        .route("/execute", post(execute_legacy))
        .route("/job/{job_id}/status", get(job_status))
        .route("/stream/{job_id}", get(stream_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "architecture": "queue_worker_sse" }))
}

async fn submit_job(
    State(state): State<AppState>,
    Json(payload): Json<Payload>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.dispatcher.submit(payload).await?;
    Ok(Json(JobResponse {
        job_id: job.id,
        stream_url: format!("/stream/{}", job.id),
    }))
}

/// Older clients posted here and polled; they get the same job handle.
async fn execute_legacy(
    state: State<AppState>,
    payload: Json<Payload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(job) = submit_job(state, payload).await?;
    Ok(Json(json!({
        "message": "Use /job endpoint with SSE streaming for better experience",
        "job": job,
    })))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let job_id: JobId = job_id.parse()?;
    let record = state.dispatcher.status(job_id).await?;
    let error = record.outcome.as_ref().and_then(|o| o.error.clone());
    Ok(Json(StatusResponse {
        job_id,
        status: record.status,
        result: record.outcome,
        error,
    }))
}

async fn stream_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job_id: JobId = job_id.parse()?;
    let events = job_events(job_id, state.store, state.channel, state.stream_timeout)
        .map(|event| Ok(to_sse(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &StreamEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        Err(e) => Event::default().data(
            json!({ "type": "error", "error": format!("unencodable event: {e}") }).to_string(),
        ),
    }
}

/// Error type for HTTP handlers. Renders as `{"error", "code"}` JSON.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::QueueFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_FULL"),
            Error::UnsupportedEncoding { .. } => (StatusCode::BAD_REQUEST, "UNSUPPORTED_ENCODING"),
            Error::SourceUnavailable(_) | Error::UnserializableArgument { .. } => {
                (StatusCode::BAD_REQUEST, "BAD_PAYLOAD")
            }
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            other => {
                tracing::error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };
        let body = json!({ "error": self.0.to_string(), "code": code });
        (status, Json(body)).into_response()
    }
}
