//! Error taxonomy shared by the router, workers, and ingress.
//!
//! The worker/router boundary speaks tagged variants instead of inspecting
//! exception payloads: a worker resolves each queued request with either a
//! verbatim upstream body (success *and* permanent upstream errors) or one of
//! the transient variants below, and the router's dispatch is a plain match.
//!
//! Only [`ProxyError::AllEndpointsFailed`] and [`ProxyError::BadRequest`]
//! ever reach a client; everything else is consumed by failover.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// The upstream returned a well-formed JSON-RPC error classified as
    /// retryable on another endpoint. Carries the original error object.
    #[error("transient upstream error: {0}")]
    TransientUpstream(Value),

    /// Transport-level failure (DNS, reset, timeout) that was not a
    /// rate-limit verdict. The router treats this like a transient error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The worker's queue is at capacity.
    #[error("worker queue is full")]
    QueueFull,

    /// The worker entered the ERROR state or shut down with this request
    /// still pending.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Every endpoint was exhausted under the retry policy.
    #[error("All RPC endpoints failed: {0}")]
    AllEndpointsFailed(String),

    /// Ingress validation failure.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// Statistics persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether the router should try another endpoint after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProxyError::TransientUpstream(_)
                | ProxyError::Transport(_)
                | ProxyError::QueueFull
                | ProxyError::WorkerUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transient_classification() {
        assert!(ProxyError::TransientUpstream(json!({"code": 19})).is_transient());
        assert!(ProxyError::Transport("connection reset".into()).is_transient());
        assert!(ProxyError::QueueFull.is_transient());
        assert!(ProxyError::WorkerUnavailable("shutting down".into()).is_transient());

        assert!(!ProxyError::AllEndpointsFailed("x".into()).is_transient());
        assert!(!ProxyError::BadRequest("x".into()).is_transient());
        assert!(!ProxyError::Storage("x".into()).is_transient());
    }

    #[test]
    fn test_display_carries_context() {
        let err = ProxyError::AllEndpointsFailed("connection refused".into());
        assert_eq!(err.to_string(), "All RPC endpoints failed: connection refused");
    }
}
