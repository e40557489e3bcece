//! Vision LLM client abstraction for gradeflow.
//!
//! The grading engine talks to its language model through one narrow trait,
//! [`LlmClient`]: a chat-style completion call whose messages can carry page
//! images alongside text. Everything provider-specific lives behind it.
//!
//! # Providers
//!
//! - [`OpenAiCompatClient`] - remote provider speaking the OpenAI-compatible
//!   chat-completions wire shape (works against OpenAI, vLLM, Ollama's
//!   compatibility endpoint, and most hosted gateways).
//! - [`ScriptedClient`] - deterministic stub replaying a queue of scripted
//!   outcomes. Used by the engine's integration tests and for offline runs.
//!
//! # Example
//!
//! ```rust,ignore
//! use llm::{ChatMessage, CompletionRequest, LlmClient, OpenAiCompatClient, RemoteConfig};
//!
//! let client = OpenAiCompatClient::new(RemoteConfig::from_env(
//!     "LLM_API_KEY",
//!     "https://api.openai.com/v1",
//!     "gpt-4o",
//! )?);
//!
//! let request = CompletionRequest::new(vec![
//!     ChatMessage::system("You are a strict exam grader."),
//!     ChatMessage::user_with_image("Grade this page.", page_bytes, "image/png"),
//! ]);
//! let response = client.complete(request).await?;
//! println!("{} ({} tokens)", response.content, response.usage.total_tokens());
//! ```

pub mod error;
pub mod remote;
pub mod scripted;
pub mod traits;
pub mod types;

pub use error::{LlmError, Result};
pub use remote::{OpenAiCompatClient, RemoteConfig};
pub use scripted::{ScriptedClient, ScriptedOutcome};
pub use traits::LlmClient;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, ContentPart, Role, TokenUsage};
