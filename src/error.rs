//! Error types for roam.

use thiserror::Error;

use crate::model::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("argument {position} cannot be serialized: {reason}")]
    UnserializableArgument { position: String, reason: String },

    #[error("job queue is full ({depth} jobs pending)")]
    QueueFull { depth: usize },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("unsupported payload encoding version {found} (expected {expected})")]
    UnsupportedEncoding { found: u32, expected: u32 },

    /// The remote execution produced a failure outcome. Fields are carried
    /// verbatim from the outcome.
    #[error("remote execution failed: {error}")]
    Remote {
        error: String,
        trace: Option<String>,
    },

    #[error("result stream ended without any event")]
    StreamExhausted,

    #[error("timed out after {0:?} waiting for the job outcome")]
    Timeout(std::time::Duration),

    #[error("blocking call attempted from inside an async runtime; use `call(..).await` instead")]
    BlockingInAsync,

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
