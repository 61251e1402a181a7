//! Full round trip: client -> gateway -> queue -> worker child process -> stream.

use std::sync::Arc;
use std::time::Duration;

use roam::broker::MemoryBroker;
use roam::client::RemoteEnv;
use roam::engine::{Dispatcher, ProcessBackend, WorkerConfig, WorkerPool};
use roam::error::Error;
use roam::gateway::{AppState, router};
use roam::payload::{FunctionRef, PayloadBuilder};
use serde_json::json;

struct Stack {
    env: RemoteEnv,
    pool: WorkerPool,
}

async fn start() -> Stack {
    let broker = Arc::new(MemoryBroker::new());
    let backend = ProcessBackend::new(env!("CARGO_BIN_EXE_roam")).with_timeout(Duration::from_secs(20));
    let pool = WorkerPool::new(
        broker.clone(),
        broker.clone(),
        broker.clone(),
        Arc::new(backend),
        WorkerConfig {
            workers: 2,
            dequeue_backoff: Duration::from_millis(10),
        },
    );
    {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run().await });
    }

    let app = router(AppState {
        dispatcher: Dispatcher::new(broker.clone(), broker.clone()),
        store: broker.clone(),
        channel: broker,
        stream_timeout: Duration::from_secs(30),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });

    Stack {
        env: RemoteEnv::new(format!("http://{addr}")).with_wait_timeout(Duration::from_secs(30)),
        pool,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_calls_return_the_function_results() {
    let stack = start().await;
    let env = &stack.env;

    let two = env
        .call(PayloadBuilder::new(FunctionRef::new("add_numbers")).build().unwrap())
        .await
        .unwrap();
    assert_eq!(two, json!(2));

    let twelve: i64 = env
        .call_as(
            PayloadBuilder::new(FunctionRef::new("multiply"))
                .kwarg("a", &3)
                .kwarg("b", &4)
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(twelve, 12);

    let greeting = env
        .call(
            PayloadBuilder::new(FunctionRef::new("greet"))
                .arg("World")
                .kwarg("greeting", "Hi")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(greeting, json!("Hi, World!"));

    stack.pool.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_errors_reach_the_caller() {
    let stack = start().await;
    let err = stack
        .env
        .call(
            PayloadBuilder::new(FunctionRef::new("divide"))
                .arg(&1)
                .arg(&0)
                .build()
                .unwrap(),
        )
        .await
        .unwrap_err();
    match err {
        Error::Remote { error, trace } => {
            assert!(error.contains("division by zero"), "{error}");
            assert!(trace.is_some());
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    stack.pool.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_jobs_remain_visible_to_status_polls() {
    let stack = start().await;
    let payload = PayloadBuilder::new(FunctionRef::new("fibonacci"))
        .arg(&10)
        .build()
        .unwrap();
    let job = stack.env.submit(&payload).await.unwrap();
    let outcome = stack.env.wait(&job).await.unwrap();
    assert_eq!(outcome.return_value, Some(json!(55)));

    let status = stack.env.status(job.job_id).await.unwrap();
    assert_eq!(status.status, roam::model::JobStatus::Completed);
    assert_eq!(status.result, Some(outcome));
    stack.pool.shutdown();
}
