//! Orchestrated sandbox execution backend.
//!
//! Instead of a local child process, each payload runs as an isolated unit on
//! an orchestration platform. The backend launches it, polls its phase on a
//! fixed interval up to an overall timeout, reads its log as the outcome, and
//! always requests teardown afterwards. Teardown is best-effort: failures are
//! logged and never reach the caller.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ExecutionBackend;
use super::child::PAYLOAD_ENV;
use super::process::interpret_exit;
use crate::config::secrets::{SecretString, bearer};
use crate::error::{Error, Result};
use crate::model::{FailureKind, JobId, Outcome, QueueEntry};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(300);
/// Upper bound on a single orchestration request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Teardown runs after the job's own deadline, so it gets a separate bound.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource limits requested for each sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu: String,
    pub memory: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: "500m".to_string(),
            memory: "512Mi".to_string(),
        }
    }
}

/// What to run in a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
}

/// Platform-assigned handle of a launched sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle(pub String);

/// Lifecycle phase reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl SandboxPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, SandboxPhase::Succeeded | SandboxPhase::Failed)
    }
}

/// Narrow interface to the orchestration platform.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    async fn launch(&self, spec: &SandboxSpec) -> Result<SandboxHandle>;
    async fn phase(&self, handle: &SandboxHandle) -> Result<SandboxPhase>;
    async fn logs(&self, handle: &SandboxHandle) -> Result<String>;
    async fn teardown(&self, handle: &SandboxHandle) -> Result<()>;
}

/// Runs payloads through a [`SandboxApi`].
pub struct SandboxBackend<A> {
    api: A,
    image: String,
    limits: ResourceLimits,
    poll_interval: Duration,
    timeout: Duration,
}

impl<A: SandboxApi> SandboxBackend<A> {
    pub fn new(api: A, image: impl Into<String>) -> Self {
        Self {
            api,
            image: image.into(),
            limits: ResourceLimits::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_SANDBOX_TIMEOUT,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.timeout = timeout;
        self
    }

    fn spec_for(&self, entry: &QueueEntry) -> Result<SandboxSpec> {
        Ok(SandboxSpec {
            name: format!("roam-job-{}", entry.job_id.0.simple()),
            image: self.image.clone(),
            command: vec!["roam".to_string(), "exec".to_string()],
            env: vec![
                (PAYLOAD_ENV.to_string(), serde_json::to_string(&entry.payload)?),
                ("ROAM_JOB_ID".to_string(), entry.job_id.to_string()),
            ],
            limits: self.limits.clone(),
        })
    }

    /// Poll until the sandbox finishes. Returns None on timeout.
    async fn wait_finished(&self, handle: &SandboxHandle, start: Instant) -> Result<Option<SandboxPhase>> {
        loop {
            let phase = self.api.phase(handle).await?;
            if phase.is_finished() {
                return Ok(Some(phase));
            }
            if start.elapsed() + self.poll_interval > self.timeout {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn teardown(&self, job_id: JobId, handle: &SandboxHandle) {
        match tokio::time::timeout(TEARDOWN_TIMEOUT, self.api.teardown(handle)).await {
            Ok(Ok(())) => debug!(job_id = %job_id, sandbox = %handle.0, "sandbox torn down"),
            Ok(Err(e)) => warn!(job_id = %job_id, sandbox = %handle.0, "sandbox teardown failed: {e}"),
            Err(_) => warn!(job_id = %job_id, sandbox = %handle.0, "sandbox teardown timed out"),
        }
    }

    fn timed_out(&self) -> Outcome {
        Outcome::failure(
            FailureKind::Timeout,
            format!("sandbox exceeded the {}s timeout", self.timeout.as_secs_f64()),
        )
    }
}

#[async_trait]
impl<A: SandboxApi> ExecutionBackend for SandboxBackend<A> {
    async fn execute(&self, entry: &QueueEntry) -> Result<Outcome> {
        let start = Instant::now();
        let spec = self.spec_for(entry)?;
        // Every platform call counts against the overall deadline.
        let handle = match tokio::time::timeout(self.timeout, self.api.launch(&spec)).await {
            Ok(handle) => handle?,
            Err(_) => {
                warn!(job_id = %entry.job_id, "sandbox launch did not answer in time");
                let mut outcome = self.timed_out();
                outcome.duration_ms = start.elapsed().as_millis() as u64;
                return Ok(outcome);
            }
        };
        info!(job_id = %entry.job_id, sandbox = %handle.0, "sandbox launched");

        let remaining = self.timeout.saturating_sub(start.elapsed());
        let result = match tokio::time::timeout(remaining, self.collect(entry, &handle, start)).await {
            Ok(result) => result,
            Err(_) => Ok(self.timed_out()),
        };
        self.teardown(entry.job_id, &handle).await;

        let mut outcome = result?;
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        Ok(outcome)
    }
}

impl<A: SandboxApi> SandboxBackend<A> {
    async fn collect(&self, entry: &QueueEntry, handle: &SandboxHandle, start: Instant) -> Result<Outcome> {
        let Some(phase) = self.wait_finished(handle, start).await? else {
            return Ok(self.timed_out());
        };
        let logs = self.api.logs(handle).await?;
        debug!(job_id = %entry.job_id, ?phase, bytes = logs.len(), "sandbox finished");
        let code = match phase {
            SandboxPhase::Succeeded => Some(0),
            _ => Some(1),
        };
        Ok(interpret_exit(code, &logs, ""))
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// REST client for an orchestration gateway exposing
/// `POST /sandboxes`, `GET /sandboxes/{id}`, `GET /sandboxes/{id}/logs`,
/// and `DELETE /sandboxes/{id}`.
pub struct HttpSandboxApi {
    base_url: String,
    token: Option<SecretString>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct LaunchResponse {
    id: String,
}

#[derive(Deserialize)]
struct PhaseResponse {
    phase: SandboxPhase,
}

impl HttpSandboxApi {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Infrastructure(format!("cannot build orchestration client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => builder.header(reqwest::header::AUTHORIZATION, bearer(token)),
            None => builder,
        }
    }
}

fn api_error(op: &str, e: reqwest::Error) -> Error {
    Error::Infrastructure(format!("orchestration {op} failed: {e}"))
}

#[async_trait]
impl SandboxApi for HttpSandboxApi {
    async fn launch(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let resp: LaunchResponse = self
            .request(reqwest::Method::POST, "/sandboxes")
            .json(spec)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| api_error("launch", e))?
            .json()
            .await
            .map_err(|e| api_error("launch", e))?;
        Ok(SandboxHandle(resp.id))
    }

    async fn phase(&self, handle: &SandboxHandle) -> Result<SandboxPhase> {
        let resp: PhaseResponse = self
            .request(reqwest::Method::GET, &format!("/sandboxes/{}", handle.0))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| api_error("status", e))?
            .json()
            .await
            .map_err(|e| api_error("status", e))?;
        Ok(resp.phase)
    }

    async fn logs(&self, handle: &SandboxHandle) -> Result<String> {
        self.request(reqwest::Method::GET, &format!("/sandboxes/{}/logs", handle.0))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| api_error("logs", e))?
            .text()
            .await
            .map_err(|e| api_error("logs", e))
    }

    async fn teardown(&self, handle: &SandboxHandle) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("/sandboxes/{}", handle.0))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| api_error("teardown", e))?;
        Ok(())
    }
}
