//! HTTP routes and the streaming gateway, driven through `oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use roam::broker::{JobQueue, MemoryBroker, ResultChannel, StatusStore};
use roam::client::SseDecoder;
use roam::engine::Dispatcher;
use roam::gateway::{AppState, StreamEvent, job_events, router};
use roam::model::{Job, JobId, JobStatus, Outcome};
use roam::payload::{FunctionRef, PayloadBuilder};
use serde_json::{Value, json};
use tower::ServiceExt;

fn state(broker: Arc<MemoryBroker>, stream_timeout: Duration) -> AppState {
    AppState {
        dispatcher: Dispatcher::new(broker.clone(), broker.clone()),
        store: broker.clone(),
        channel: broker,
        stream_timeout,
    }
}

fn app(broker: Arc<MemoryBroker>) -> axum::Router {
    router(state(broker, Duration::from_secs(5)))
}

fn greet_json() -> Value {
    serde_json::to_value(
        PayloadBuilder::new(FunctionRef::new("greet"))
            .arg("World")
            .build()
            .unwrap(),
    )
    .unwrap()
}

async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn sse_events(body: &[u8]) -> Vec<StreamEvent> {
    let mut decoder = SseDecoder::new();
    decoder.push(body);
    let mut events = Vec::new();
    while let Some(data) = decoder.next_data() {
        events.push(serde_json::from_str(&data).unwrap());
    }
    events
}

/// Insert a job and drive it to a terminal status directly through the store.
async fn finished_job(broker: &MemoryBroker, outcome: &Outcome) -> Job {
    let job = Job::new(PayloadBuilder::new(FunctionRef::new("add_numbers")).build().unwrap());
    broker.insert(&job).await.unwrap();
    broker
        .transition(job.id, JobStatus::Pending, JobStatus::Running)
        .await
        .unwrap();
    broker
        .record_outcome(job.id, outcome.status(), outcome)
        .await
        .unwrap();
    job
}

// ---------------------------------------------------------------------------
// Plain routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_endpoints_report_ok() {
    let broker = Arc::new(MemoryBroker::new());
    for path in ["/healthz", "/health"] {
        let (status, body) = send(app(broker.clone()), get(path)).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
    }
}

#[tokio::test]
async fn submit_returns_job_id_and_stream_url() {
    let broker = Arc::new(MemoryBroker::new());
    let (status, body) = send(app(broker.clone()), post_json("/job", &greet_json())).await;
    assert_eq!(status, StatusCode::OK);

    let body: Value = serde_json::from_slice(&body).unwrap();
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert_eq!(body["stream_url"], format!("/stream/{job_id}"));
    assert_eq!(broker.depth().await.unwrap(), 1);

    let (status, body) = send(app(broker), get(&format!("/job/{job_id}/status"))).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "pending");
    assert!(body.get("result").is_none());
}

#[tokio::test]
async fn legacy_execute_wraps_the_job_handle() {
    let broker = Arc::new(MemoryBroker::new());
    let (status, body) = send(app(broker), post_json("/execute", &greet_json())).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["job"]["job_id"].is_string());
    assert!(body["message"].as_str().unwrap().contains("/job"));
}

#[tokio::test]
async fn unsupported_encoding_is_a_bad_request() {
    let broker = Arc::new(MemoryBroker::new());
    let mut payload = greet_json();
    payload["version"] = json!(7);
    let (status, body) = send(app(broker), post_json("/job", &payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["code"], "UNSUPPORTED_ENCODING");
}

#[tokio::test]
async fn full_queue_is_service_unavailable() {
    let broker = Arc::new(MemoryBroker::new().with_max_depth(1));
    let (first, _) = send(app(broker.clone()), post_json("/job", &greet_json())).await;
    assert_eq!(first, StatusCode::OK);
    let (second, body) = send(app(broker), post_json("/job", &greet_json())).await;
    assert_eq!(second, StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["code"], "QUEUE_FULL");
}

#[tokio::test]
async fn status_of_unknown_and_malformed_ids() {
    let broker = Arc::new(MemoryBroker::new());
    let unknown = JobId::new();
    let (status, body) = send(app(broker.clone()), get(&format!("/job/{unknown}/status"))).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "not_found");

    let (status, _) = send(app(broker), get("/job/not-a-uuid/status")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_of_a_failed_job_carries_the_error() {
    let broker = Arc::new(MemoryBroker::new());
    let job = finished_job(
        &broker,
        &Outcome::failure(roam::model::FailureKind::UserError, "division by zero"),
    )
    .await;
    let (_, body) = send(app(broker), get(&format!("/job/{}/status", job.id))).await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "division by zero");
    assert_eq!(body["result"]["success"], false);
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_subscriber_recovers_the_stored_outcome() {
    let broker = Arc::new(MemoryBroker::new());
    let outcome = Outcome::success(json!("Hi, World!"));
    let job = finished_job(&broker, &outcome).await;

    let (status, body) = send(app(broker), get(&format!("/stream/{}", job.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        sse_events(&body),
        vec![
            StreamEvent::Connected { job_id: job.id },
            StreamEvent::Result { data: outcome },
            StreamEvent::Complete,
        ]
    );
}

#[tokio::test]
async fn stream_for_unknown_job_ends_with_error() {
    let broker = Arc::new(MemoryBroker::new());
    let id = JobId::new();
    let (_, body) = send(app(broker), get(&format!("/stream/{id}"))).await;
    let events = sse_events(&body);
    assert_eq!(events[0], StreamEvent::Connected { job_id: id });
    assert!(matches!(&events[1], StreamEvent::Error { error } if error.contains("not found")));
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn live_outcome_is_delivered_to_the_waiting_session() {
    let broker = Arc::new(MemoryBroker::new());
    let job = Job::new(PayloadBuilder::new(FunctionRef::new("add_numbers")).build().unwrap());
    broker.insert(&job).await.unwrap();

    let mut events = job_events(job.id, broker.clone(), broker.clone(), Duration::from_secs(5));
    assert_eq!(
        events.next().await.unwrap(),
        StreamEvent::Connected { job_id: job.id }
    );

    // Finish the job the way a worker does: store first, then publish.
    let outcome = Outcome::success(json!(2));
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker
        .transition(job.id, JobStatus::Pending, JobStatus::Running)
        .await
        .unwrap();
    broker
        .record_outcome(job.id, JobStatus::Completed, &outcome)
        .await
        .unwrap();
    broker.publish(job.id, &outcome).await.unwrap();

    assert_eq!(
        events.next().await.unwrap(),
        StreamEvent::Result { data: outcome }
    );
    assert_eq!(events.next().await.unwrap(), StreamEvent::Complete);
    assert!(events.next().await.is_none());
}

#[tokio::test]
async fn waiting_session_gives_up_after_the_stream_timeout() {
    let broker = Arc::new(MemoryBroker::new());
    let job = Job::new(PayloadBuilder::new(FunctionRef::new("sleep")).arg(&60).build().unwrap());
    broker.insert(&job).await.unwrap();

    let events: Vec<StreamEvent> =
        job_events(job.id, broker.clone(), broker.clone(), Duration::from_millis(50))
            .collect()
            .await;
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[1], StreamEvent::Error { .. }));
    assert!(events.iter().all(|e| !matches!(e, StreamEvent::Result { .. })));
}

#[test]
fn stream_events_use_the_documented_json_shapes() {
    let id = JobId::new();
    assert_eq!(
        serde_json::to_value(StreamEvent::Connected { job_id: id }).unwrap(),
        json!({ "type": "connected", "job_id": id.to_string() })
    );
    assert_eq!(
        serde_json::to_value(StreamEvent::Complete).unwrap(),
        json!({ "type": "complete" })
    );
    assert_eq!(
        serde_json::to_value(StreamEvent::Error { error: "boom".into() }).unwrap(),
        json!({ "type": "error", "error": "boom" })
    );
    let result = serde_json::to_value(StreamEvent::Result {
        data: Outcome::success(json!(12)),
    })
    .unwrap();
    assert_eq!(result["type"], "result");
    assert_eq!(result["data"]["return_value"], 12);
}
