//! Error types for LLM providers.

use std::time::Duration;
use thiserror::Error;

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur when calling an LLM provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Transient failure: network trouble, 5xx, connection reset.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The provider rejected the call for rate limiting. `retry_after`
    /// carries the provider's cool-down hint when one was supplied.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The call completed but the payload was not usable (empty choices,
    /// malformed body).
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The per-call timeout elapsed.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// API authentication failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Client misconfiguration (missing key, bad base URL).
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP transport failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to serialize or deserialize payloads.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LlmError {
    /// Whether the caller should retry this error with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transient(_)
            | LlmError::RateLimited { .. }
            | LlmError::Timeout(_) => true,
            LlmError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => false,
        }
    }

    /// Provider-supplied cool-down, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::Serialization(err.to_string())
    }
}
