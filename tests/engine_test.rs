//! Integration tests for the execution engine: the child-process backend,
//! the worker pool, and the stale-job reaper.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use roam::broker::{MemoryBroker, ResultChannel, StatusStore};
use roam::engine::process::interpret_exit;
use roam::engine::{
    Dispatcher, ExecutionBackend, ProcessBackend, Reaper, WorkerConfig, WorkerPool,
};
use roam::error::{Error, Result};
use roam::model::{FailureKind, Job, JobId, JobStatus, Outcome, QueueEntry, StatusRecord};
use roam::payload::{FunctionRef, PayloadBuilder};
use serde_json::json;

fn backend() -> ProcessBackend {
    ProcessBackend::new(env!("CARGO_BIN_EXE_roam")).with_timeout(Duration::from_secs(10))
}

fn entry(builder: PayloadBuilder) -> QueueEntry {
    Job::new(builder.build().unwrap()).queue_entry()
}

fn call(function: &str) -> PayloadBuilder {
    PayloadBuilder::new(FunctionRef::new(function))
}

// ---------------------------------------------------------------------------
// Child-process backend
// ---------------------------------------------------------------------------

#[tokio::test]
async fn process_backend_runs_the_concrete_scenarios() {
    let backend = backend();

    let outcome = backend.execute(&entry(call("add_numbers"))).await.unwrap();
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.return_value, Some(json!(2)));

    let outcome = backend
        .execute(&entry(call("multiply").kwarg("a", &3).kwarg("b", &4)))
        .await
        .unwrap();
    assert_eq!(outcome.return_value, Some(json!(12)));

    let outcome = backend
        .execute(&entry(call("greet").arg("World").kwarg("greeting", "Hi")))
        .await
        .unwrap();
    assert_eq!(outcome.return_value, Some(json!("Hi, World!")));

    let outcome = backend
        .execute(&entry(call("divide").arg(&1).arg(&0)))
        .await
        .unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("division by zero"));
    assert_eq!(outcome.kind, Some(FailureKind::UserError));
    assert!(outcome.trace.is_some());
}

#[tokio::test]
async fn process_backend_keeps_user_output_separate() {
    let outcome = backend()
        .execute(&entry(call("print_then_fail").arg("bad input")))
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("bad input"));
    assert_eq!(outcome.stdout, "about to fail: bad input\n");
}

#[tokio::test]
async fn process_backend_kills_jobs_past_the_timeout() {
    let backend = backend().with_timeout(Duration::from_millis(500));
    let started = std::time::Instant::now();
    let outcome = backend
        .execute(&entry(call("sleep").arg(&30)))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!outcome.success);
    assert_eq!(outcome.kind, Some(FailureKind::Timeout));
    assert_eq!(outcome.status(), JobStatus::TimedOut);
    assert!(outcome.return_value.is_none());
    assert!(outcome.error.unwrap().contains("timeout"));
}

#[tokio::test]
async fn missing_binary_is_an_infrastructure_error() {
    let backend = ProcessBackend::new("/nonexistent/roam-binary");
    let err = backend.execute(&entry(call("add_numbers"))).await.unwrap_err();
    assert!(matches!(err, Error::Infrastructure(_)), "got {err:?}");
}

#[test]
fn exit_interpretation_distinguishes_failure_causes() {
    let clean = interpret_exit(Some(0), "no marker here\n", "");
    assert_eq!(clean.kind, Some(FailureKind::UnparseableOutput));
    assert_eq!(clean.error.as_deref(), Some("failed to parse execution result"));
    assert_eq!(clean.stdout, "no marker here\n");

    let crashed = interpret_exit(Some(101), "", "thread 'main' panicked");
    assert_eq!(crashed.kind, Some(FailureKind::ProcessExit));
    assert_eq!(crashed.error.as_deref(), Some("process exited with status 101"));
    assert_eq!(crashed.stderr.as_deref(), Some("thread 'main' panicked"));

    let signalled = interpret_exit(None, "", "");
    assert_eq!(signalled.kind, Some(FailureKind::ProcessExit));
    assert!(signalled.stderr.is_none());

    let parsed = interpret_exit(
        Some(1),
        "out\n\n__ROAM_OUTCOME__ {\"success\":true,\"return_value\":7}\n",
        "warn",
    );
    assert!(parsed.success);
    assert_eq!(parsed.return_value, Some(json!(7)));
    assert_eq!(parsed.stdout, "out\n");
    assert_eq!(parsed.stderr.as_deref(), Some("warn"));
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Backend that answers from the payload without spawning anything.
struct EchoBackend {
    calls: AtomicUsize,
}

#[async_trait]
impl ExecutionBackend for EchoBackend {
    async fn execute(&self, entry: &QueueEntry) -> Result<Outcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match entry.payload.function.as_str() {
            "broken" => Err(Error::Infrastructure("backend offline".into())),
            "slow" => Ok(Outcome::failure(FailureKind::Timeout, "execution exceeded the 1s timeout")),
            name => Ok(Outcome::success(json!(name))),
        }
    }
}

struct Harness {
    broker: Arc<MemoryBroker>,
    dispatcher: Dispatcher,
    pool: WorkerPool,
    backend: Arc<EchoBackend>,
}

fn harness(workers: usize) -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    let backend = Arc::new(EchoBackend {
        calls: AtomicUsize::new(0),
    });
    let pool = WorkerPool::new(
        broker.clone(),
        broker.clone(),
        broker.clone(),
        backend.clone(),
        WorkerConfig {
            workers,
            dequeue_backoff: Duration::from_millis(10),
        },
    );
    Harness {
        dispatcher: Dispatcher::new(broker.clone(), broker.clone()),
        broker,
        pool,
        backend,
    }
}

async fn wait_terminal(store: &dyn StatusStore, job: &Job) -> JobStatus {
    for _ in 0..200 {
        let status = store.get(job.id).await.unwrap().status;
        if status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never finished", job.id);
}

#[tokio::test]
async fn pool_executes_each_job_once_and_publishes() {
    let h = harness(3);
    let job = h.dispatcher.submit(call("hello").build().unwrap()).await.unwrap();
    let mut stream = h.broker.subscribe(job.id).await.unwrap();

    let runner = {
        let pool = h.pool.clone();
        tokio::spawn(async move { pool.run().await })
    };

    let published = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(published.return_value, Some(json!("hello")));

    // The store is written before the outcome is published.
    let record = h.broker.get(job.id).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.outcome, Some(published));

    let mut jobs = Vec::new();
    for n in 0..20 {
        jobs.push(
            h.dispatcher
                .submit(call(&format!("job_{n}")).build().unwrap())
                .await
                .unwrap(),
        );
    }
    for job in &jobs {
        assert_eq!(wait_terminal(h.broker.as_ref(), job).await, JobStatus::Completed);
    }
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 21);

    h.pool.shutdown();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn backend_errors_and_timeouts_become_terminal_statuses() {
    let h = harness(1);
    let runner = {
        let pool = h.pool.clone();
        tokio::spawn(async move { pool.run().await })
    };

    let broken = h.dispatcher.submit(call("broken").build().unwrap()).await.unwrap();
    let slow = h.dispatcher.submit(call("slow").build().unwrap()).await.unwrap();

    assert_eq!(wait_terminal(h.broker.as_ref(), &broken).await, JobStatus::Failed);
    let outcome = h.broker.get(broken.id).await.unwrap().outcome.unwrap();
    assert_eq!(outcome.kind, Some(FailureKind::Infrastructure));
    assert!(outcome.error.unwrap().starts_with("infrastructure:"));

    assert_eq!(wait_terminal(h.broker.as_ref(), &slow).await, JobStatus::TimedOut);

    h.pool.shutdown();
    runner.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Reaper
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reaper_fails_jobs_whose_worker_vanished() {
    let broker = Arc::new(MemoryBroker::new());
    let job = Job::new(call("lost").build().unwrap());
    broker.insert(&job).await.unwrap();
    broker
        .transition(job.id, JobStatus::Pending, JobStatus::Running)
        .await
        .unwrap();
    let mut stream = broker.subscribe(job.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let reaper = Reaper::new(broker.clone(), broker.clone(), Duration::from_millis(10));
    assert_eq!(reaper.reap_once().await.unwrap(), 1);

    let outcome = stream.next().await.unwrap().unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("worker lost"));
    assert_eq!(broker.get(job.id).await.unwrap().status, JobStatus::Failed);

    // Already failed; a second sweep finds nothing.
    assert_eq!(reaper.reap_once().await.unwrap(), 0);
}

#[tokio::test]
async fn reaper_leaves_fresh_jobs_alone() {
    let broker = Arc::new(MemoryBroker::new());
    let job = Job::new(call("busy").build().unwrap());
    broker.insert(&job).await.unwrap();
    broker
        .transition(job.id, JobStatus::Pending, JobStatus::Running)
        .await
        .unwrap();

    let reaper = Reaper::new(broker.clone(), broker.clone(), Duration::from_secs(60));
    assert_eq!(reaper.reap_once().await.unwrap(), 0);
    assert_eq!(broker.get(job.id).await.unwrap().status, JobStatus::Running);
}

/// Status store whose first `transition` fails as if the connection dropped.
struct FlakyStore {
    inner: Arc<MemoryBroker>,
    failures: AtomicUsize,
}

#[async_trait]
impl StatusStore for FlakyStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        self.inner.insert(job).await
    }

    async fn discard(&self, id: JobId) -> Result<()> {
        self.inner.discard(id).await
    }

    async fn transition(&self, id: JobId, from: JobStatus, to: JobStatus) -> Result<()> {
        if self.failures.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::Infrastructure("connection reset".into()));
        }
        self.inner.transition(id, from, to).await
    }

    async fn record_outcome(&self, id: JobId, status: JobStatus, outcome: &Outcome) -> Result<()> {
        self.inner.record_outcome(id, status, outcome).await
    }

    async fn get(&self, id: JobId) -> Result<StatusRecord> {
        self.inner.get(id).await
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        self.inner.list_stale(cutoff).await
    }
}

#[tokio::test]
async fn store_fault_before_running_fails_the_job() {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(FlakyStore {
        inner: broker.clone(),
        failures: AtomicUsize::new(0),
    });
    let backend = Arc::new(EchoBackend {
        calls: AtomicUsize::new(0),
    });
    let dispatcher = Dispatcher::new(broker.clone(), store.clone());
    let pool = WorkerPool::new(
        broker.clone(),
        store.clone(),
        broker.clone(),
        backend.clone(),
        WorkerConfig {
            workers: 1,
            dequeue_backoff: Duration::from_millis(10),
        },
    );

    let job = dispatcher.submit(call("hello").build().unwrap()).await.unwrap();
    let mut stream = broker.subscribe(job.id).await.unwrap();
    let runner = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run().await })
    };

    let published = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(published.kind, Some(FailureKind::Infrastructure));
    assert!(published.error.unwrap().contains("connection reset"));
    assert_eq!(wait_terminal(store.as_ref(), &job).await, JobStatus::Failed);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

    // Later jobs run normally.
    let next = dispatcher.submit(call("again").build().unwrap()).await.unwrap();
    assert_eq!(wait_terminal(store.as_ref(), &next).await, JobStatus::Completed);

    pool.shutdown();
    runner.await.unwrap().unwrap();
}
