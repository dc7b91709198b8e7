//! Error types for downstream calls.

use std::time::Duration;

use crate::resilience::circuit_breaker::BreakerOpenError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures reported by the HTTP transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read response body: {0}")]
    Body(#[source] axum::Error),

    #[error("downstream call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport is shut down")]
    Shutdown,
}

/// Every way a downstream call can fail.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The guarding circuit breaker is open. Expected and frequent.
    #[error(transparent)]
    BreakerOpen(#[from] BreakerOpenError),

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Something other than the breaker failed while setting up the call.
    #[error("call setup failed: {0}")]
    Setup(String),

    #[error("downstream call failed: {0}")]
    Downstream(#[from] TransportError),

    /// The caller's response handler failed on a successful response.
    #[error("response handler failed: {0}")]
    Handler(#[source] BoxError),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("no transport processing state was supplied for this call")]
    MissingProcessingState,
}

impl CallError {
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, CallError::BreakerOpen(_))
    }
}

/// Failures constructing a client.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to start transport runtime: {0}")]
    Runtime(#[from] std::io::Error),
}
