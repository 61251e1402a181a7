//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    /// Postgres broker. When unset, `serve` runs with the in-memory broker.
    pub database_url: Option<SecretString>,
    pub bind_addr: SocketAddr,
    pub workers: usize,
    pub exec_timeout: Duration,
    pub max_queue_depth: Option<usize>,
    pub result_retention: Duration,
    pub stream_timeout: Duration,
    pub sandbox: Option<SandboxSettings>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Orchestration platform used instead of local child processes.
#[derive(Debug)]
pub struct SandboxSettings {
    pub url: String,
    pub image: String,
    pub token: Option<SecretString>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let sandbox = match optional_var("ROAM_SANDBOX_URL") {
            Some(url) => Some(SandboxSettings {
                url,
                image: optional_var("ROAM_SANDBOX_IMAGE").unwrap_or_else(|| "roam-worker:latest".to_string()),
                token: optional_var("ROAM_SANDBOX_TOKEN").map(SecretString::from),
            }),
            None => None,
        };

        Ok(Self {
            database_url: optional_var("DATABASE_URL").map(SecretString::from),
            bind_addr: parsed_var("ROAM_BIND")?.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000))),
            workers: parsed_var("ROAM_WORKERS")?.unwrap_or(2),
            exec_timeout: Duration::from_secs(parsed_var("ROAM_EXEC_TIMEOUT_SECS")?.unwrap_or(30)),
            max_queue_depth: parsed_var("ROAM_MAX_QUEUE_DEPTH")?,
            result_retention: Duration::from_secs(
                parsed_var("ROAM_RESULT_RETENTION_SECS")?.unwrap_or(900),
            ),
            stream_timeout: Duration::from_secs(parsed_var("ROAM_STREAM_TIMEOUT_SECS")?.unwrap_or(330)),
            sandbox,
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("environment variable {name}={raw:?} is invalid: {e}")))
        })
        .transpose()
}
