//! Grading error taxonomy.
//!
//! Every failure anywhere in a run becomes a [`GradingError`] appended to
//! `GradingState.errors`. The taxonomy is closed: each kind has a fixed
//! retry classification, and the propagation policy is layered so that a
//! failed page never aborts its batch, a failed batch never aborts its
//! siblings, and only node-level fatal failures abort the run.

use chrono::{DateTime, Utc};
use llm::LlmError;
use serde::{Deserialize, Serialize};

/// Closed set of grading failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network trouble, 5xx, timeout. Retryable.
    LlmTransient,

    /// Provider rate limit; retry after the provider's cool-down.
    LlmRateLimited,

    /// The model answered but the payload was unusable. Retryable up to the
    /// configured cap, then demoted to `ParseFailure`.
    LlmInvalidResponse,

    /// Parsing gave up at the call site. Not retryable; may trigger a
    /// rubric-level fallback.
    ParseFailure,

    /// A structural invariant was violated (score above max, duplicate
    /// question id). Recorded, run continues with the result flagged.
    SchemaViolation,

    /// Student boundaries could not be determined confidently.
    BoundaryAmbiguous,

    /// A checkpoint write failed; resumability is degraded.
    CheckpointFailure,

    /// The run was cancelled cooperatively.
    Cancelled,

    /// Unexpected internal failure. Fatal for the run.
    Internal,
}

impl ErrorKind {
    /// Default retry classification for this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::LlmTransient | ErrorKind::LlmRateLimited | ErrorKind::LlmInvalidResponse
        )
    }
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingError {
    pub kind: ErrorKind,

    /// Node or stage where the failure happened.
    pub stage: String,

    /// Page this failure is attributable to, if any.
    #[serde(default)]
    pub page_index: Option<usize>,

    pub retryable: bool,

    pub message: String,

    pub timestamp: DateTime<Utc>,
}

impl GradingError {
    pub fn new(kind: ErrorKind, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage: stage.into(),
            page_index: None,
            retryable: kind.is_retryable(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_page(mut self, page_index: usize) -> Self {
        self.page_index = Some(page_index);
        self
    }

    /// Classify a provider error into the grading taxonomy.
    pub fn from_llm(err: &LlmError, stage: impl Into<String>) -> Self {
        let kind = match err {
            LlmError::Transient(_) | LlmError::Timeout(_) | LlmError::Http(_) => {
                ErrorKind::LlmTransient
            }
            LlmError::RateLimited { .. } => ErrorKind::LlmRateLimited,
            LlmError::InvalidResponse(_) | LlmError::Serialization(_) => {
                ErrorKind::LlmInvalidResponse
            }
            LlmError::Authentication(_) | LlmError::Config(_) => ErrorKind::Internal,
        };
        Self::new(kind, stage, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification_is_fixed_per_kind() {
        assert!(ErrorKind::LlmTransient.is_retryable());
        assert!(ErrorKind::LlmRateLimited.is_retryable());
        assert!(ErrorKind::LlmInvalidResponse.is_retryable());
        assert!(!ErrorKind::ParseFailure.is_retryable());
        assert!(!ErrorKind::SchemaViolation.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn llm_errors_classify_into_the_taxonomy() {
        let transient = GradingError::from_llm(
            &LlmError::Transient("502".to_string()),
            "grade_batch",
        );
        assert_eq!(transient.kind, ErrorKind::LlmTransient);
        assert!(transient.retryable);

        let auth = GradingError::from_llm(
            &LlmError::Authentication("bad key".to_string()),
            "rubric_parse",
        );
        assert_eq!(auth.kind, ErrorKind::Internal);
        assert!(!auth.retryable);
    }

    #[test]
    fn serializes_with_snake_case_kind() {
        let err = GradingError::new(ErrorKind::CheckpointFailure, "segment", "disk full");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "checkpoint_failure");
        assert_eq!(value["page_index"], serde_json::Value::Null);
    }
}
