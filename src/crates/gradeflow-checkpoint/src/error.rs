//! Error types for checkpoint storage.

use thiserror::Error;

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised by checkpoint backends.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Snapshot could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The referenced run does not exist in storage.
    #[error("unknown run: {0}")]
    UnknownRun(String),

    /// Backend-specific storage failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::Serialization(err.to_string())
    }
}
