//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for attaching secrets
//! to outbound requests without logging them.

pub use secrecy::{ExposeSecret, SecretString};

/// `Authorization` header value for a bearer token.
pub fn bearer(token: &SecretString) -> String {
    format!("Bearer {}", token.expose_secret())
}
