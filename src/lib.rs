//! # roam
//!
//! Run On Another Machine: turn a call to a registered function into a job,
//! queue it, execute it in an isolated child process on a worker, and stream
//! the outcome back to exactly the caller that is waiting for it.
//!
//! Provides the payload builder, job queue / status store / result channel
//! interfaces (in-memory and Postgres via pgmq), the worker execution engine,
//! the SSE streaming gateway, a caller-side client, and OpenTelemetry
//! observability.

pub mod broker;
pub mod client;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod model;
pub mod payload;
pub mod registry;
pub mod telemetry;
