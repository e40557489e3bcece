//! The `LlmClient` trait.

use crate::error::Result;
use crate::types::{CompletionRequest, CompletionResponse};
use async_trait::async_trait;

/// Chat completion client shared by every grading worker.
///
/// Implementations must be safe under concurrent calls: the engine holds one
/// `Arc<dyn LlmClient>` and invokes it from all fan-out workers at once.
/// Connection pooling and rate-limit budgeting are the implementation's
/// responsibility; callers only react to the error classification
/// ([`LlmError::is_retryable`](crate::error::LlmError::is_retryable) and
/// [`retry_after`](crate::error::LlmError::retry_after)).
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion to the end and return the full response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Short provider name for logging.
    fn name(&self) -> &str;
}
