//! Caller-side client.
//!
//! [`RemoteEnv`] submits a payload to the gateway, waits on the job's event
//! stream, and returns the function's return value or the remote error. When
//! the stream breaks it falls back to polling the status endpoint. In local
//! mode it runs the function in-process through a [`FunctionRegistry`].

pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::gateway::StreamEvent;
use crate::gateway::routes::{JobResponse, StatusResponse};
use crate::model::{JobId, JobStatus, Outcome};
use crate::payload::Payload;
use crate::registry::FunctionRegistry;

pub use sse::SseDecoder;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

type LocalPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Where and how calls run.
#[derive(Clone)]
pub struct RemoteEnv {
    base_url: String,
    run_locally: LocalPredicate,
    registry: FunctionRegistry,
    wait_timeout: Duration,
    poll_interval: Duration,
    http: reqwest::Client,
}

/// How a stream session ended without a usable outcome.
enum StreamEnd {
    Outcome(Outcome),
    /// The stream broke or reported an error after connecting.
    Interrupted(String),
}

impl RemoteEnv {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            run_locally: Arc::new(|| false),
            registry: FunctionRegistry::empty(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            http: reqwest::Client::new(),
        }
    }

    /// Run every call in-process against `registry`.
    pub fn local(registry: FunctionRegistry) -> Self {
        Self::new(DEFAULT_BASE_URL)
            .with_registry(registry)
            .run_locally(true)
    }

    /// Functions available for local execution.
    pub fn with_registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn run_locally(self, local: bool) -> Self {
        self.run_locally_when(move || local)
    }

    /// Decide per call whether to skip the network.
    pub fn run_locally_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.run_locally = Arc::new(predicate);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run the payload and return its return value.
    ///
    /// # Errors
    ///
    /// `Remote` carries a failed outcome's error and trace verbatim.
    /// `Timeout` means no terminal outcome arrived within the wait timeout;
    /// the remote job is not cancelled.
    pub async fn call(&self, payload: Payload) -> Result<serde_json::Value> {
        if (self.run_locally)() {
            debug!(function = %payload.function, "running locally");
            return self.registry.invoke(&payload).map_err(|e| Error::Remote {
                error: e.message,
                trace: e.trace,
            });
        }

        let job = self.submit(&payload).await?;
        info!(job_id = %job.job_id, function = %payload.function, "job submitted");
        let outcome = self.wait(&job).await?;
        into_return_value(outcome)
    }

    /// Like [`RemoteEnv::call`], decoding the return value into `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, payload: Payload) -> Result<T> {
        Ok(serde_json::from_value(self.call(payload).await?)?)
    }

    /// Blocking form of [`RemoteEnv::call`] for synchronous callers.
    ///
    /// Fails with `BlockingInAsync` when invoked from a thread that is
    /// already driving a tokio runtime.
    pub fn call_blocking(&self, payload: Payload) -> Result<serde_json::Value> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::BlockingInAsync);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.call(payload))
    }

    /// Submit without waiting.
    pub async fn submit(&self, payload: &Payload) -> Result<JobResponse> {
        let resp = self
            .http
            .post(format!("{}/job", self.base_url))
            .json(payload)
            .send()
            .await?;
        Ok(checked(resp).await?.json().await?)
    }

    /// Current status via the polling endpoint.
    pub async fn status(&self, job_id: JobId) -> Result<StatusResponse> {
        let resp = self
            .http
            .get(format!("{}/job/{job_id}/status", self.base_url))
            .send()
            .await?;
        Ok(checked(resp).await?.json().await?)
    }

    /// Wait for a submitted job's outcome, streaming first and polling if
    /// the stream breaks.
    pub async fn wait(&self, job: &JobResponse) -> Result<Outcome> {
        let job_id = job.job_id;
        let waiting = async {
            match self.stream(job).await? {
                StreamEnd::Outcome(outcome) => Ok(outcome),
                StreamEnd::Interrupted(reason) => {
                    warn!(%job_id, "stream interrupted ({reason}), polling status");
                    self.poll(job_id).await
                }
            }
        };
        tokio::time::timeout(self.wait_timeout, waiting)
            .await
            .map_err(|_| Error::Timeout(self.wait_timeout))?
    }

    async fn stream(&self, job: &JobResponse) -> Result<StreamEnd> {
        let url = if job.stream_url.starts_with("http") {
            job.stream_url.clone()
        } else {
            format!("{}{}", self.base_url, job.stream_url)
        };
        let resp = match self.http.get(&url).send().await.and_then(|r| r.error_for_status()) {
            Ok(r) => r,
            Err(e) => return Ok(StreamEnd::Interrupted(e.to_string())),
        };

        let mut bytes = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut seen = 0usize;
        let mut result: Option<Outcome> = None;

        loop {
            while let Some(data) = decoder.next_data() {
                seen += 1;
                let event = match serde_json::from_str::<StreamEvent>(&data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(job_id = %job.job_id, "skipping malformed stream event: {e}");
                        continue;
                    }
                };
                match event {
                    StreamEvent::Connected { .. } => debug!(job_id = %job.job_id, "stream connected"),
                    StreamEvent::Result { data } => result = Some(data),
                    StreamEvent::Complete => {
                        return Ok(match result.take() {
                            Some(outcome) => StreamEnd::Outcome(outcome),
                            None => StreamEnd::Interrupted("completed without a result".to_string()),
                        });
                    }
                    StreamEvent::Error { error } => return Ok(StreamEnd::Interrupted(error)),
                }
            }

            match bytes.next().await {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(e)) => {
                    if let Some(outcome) = result {
                        return Ok(StreamEnd::Outcome(outcome));
                    }
                    return Ok(StreamEnd::Interrupted(e.to_string()));
                }
                None => break,
            }
        }

        if let Some(outcome) = result {
            return Ok(StreamEnd::Outcome(outcome));
        }
        if seen == 0 {
            return Err(Error::StreamExhausted);
        }
        Ok(StreamEnd::Interrupted("stream ended before the outcome".to_string()))
    }

    async fn poll(&self, job_id: JobId) -> Result<Outcome> {
        loop {
            let status = self.status(job_id).await?;
            match status.status {
                JobStatus::Pending | JobStatus::Running => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                JobStatus::NotFound => return Err(Error::NotFound(format!("job {job_id}"))),
                terminal => {
                    return status.result.ok_or_else(|| {
                        Error::Infrastructure(format!(
                            "job {job_id} is {terminal} but has no stored outcome"
                        ))
                    });
                }
            }
        }
    }
}

/// Map a failed HTTP status onto the error the gateway reported.
async fn checked(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);
    Err(match status.as_u16() {
        404 => Error::NotFound(message),
        _ => Error::Infrastructure(format!("gateway returned {status}: {message}")),
    })
}

fn into_return_value(outcome: Outcome) -> Result<serde_json::Value> {
    if outcome.success {
        return Ok(outcome.return_value.unwrap_or(serde_json::Value::Null));
    }
    Err(Error::Remote {
        error: outcome
            .error
            .unwrap_or_else(|| "remote execution failed".to_string()),
        trace: outcome.trace,
    })
}
