//! OpenAI-compatible remote provider.
//!
//! Speaks the `/chat/completions` wire shape with data-URL image parts,
//! which most hosted and self-hosted vision endpoints accept. Error mapping:
//!
//! | Condition | [`LlmError`] |
//! |---|---|
//! | 401 / 403 | `Authentication` |
//! | 429 (+ `Retry-After` header) | `RateLimited` |
//! | 5xx, connect/reset | `Transient` |
//! | request deadline elapsed | `Timeout` |
//! | empty or malformed body | `InvalidResponse` |

use crate::error::{LlmError, Result};
use crate::traits::LlmClient;
use crate::types::{
    ChatMessage, CompletionRequest, CompletionResponse, ContentPart, Role, TokenUsage,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Connection settings for a remote provider.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl RemoteConfig {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    /// Read the API key from the environment.
    pub fn from_env(
        key_var: &str,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let api_key = std::env::var(key_var)
            .map_err(|_| LlmError::Config(format!("environment variable {key_var} not set")))?;
        Ok(Self::new(api_key, base_url, model))
    }
}

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct OpenAiCompatClient {
    config: RemoteConfig,
    client: Client,
}

impl OpenAiCompatClient {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(8)
            .build()
            .map_err(LlmError::Http)?;
        Ok(Self { config, client })
    }

    fn convert_message(message: &ChatMessage) -> WireMessage {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let content = message
            .content
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => WireContent::Text { text: text.clone() },
                ContentPart::Image { data, media_type } => WireContent::ImageUrl {
                    image_url: WireImageUrl {
                        url: format!("data:{media_type};base64,{data}"),
                    },
                },
            })
            .collect();
        WireMessage {
            role: role.to_string(),
            content,
        }
    }

    fn map_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> LlmError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Authentication(body),
            StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
                message: body,
                retry_after,
            },
            status if status.is_server_error() => {
                LlmError::Transient(format!("{status}: {body}"))
            }
            status => LlmError::InvalidResponse(format!("{status}: {body}")),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let body = WireRequest {
            model: self.config.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        debug!(model = %self.config.model, messages = body.messages.len(), "dispatching completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::Timeout(format!("{}s elapsed", request.timeout.as_secs_f64()))
                } else if err.is_connect() {
                    LlmError::Transient(err.to_string())
                } else {
                    LlmError::Http(err)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, retry_after, body));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response had no choices".to_string()))?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            usage,
            model: parsed.model,
        })
    }

    fn name(&self) -> &str {
        "openai-compat"
    }
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: Vec<WireContent>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContent {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Serialize)]
struct WireImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct WireResponse {
    model: String,
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_parts_become_data_urls() {
        let message = ChatMessage::user_with_image("grade", "QUJD", "image/png");
        let wire = OpenAiCompatClient::convert_message(&message);
        assert_eq!(wire.role, "user");
        let encoded = serde_json::to_value(&wire.content).unwrap();
        assert_eq!(encoded[0]["type"], "text");
        assert_eq!(encoded[1]["type"], "image_url");
        assert_eq!(
            encoded[1]["image_url"]["url"],
            "data:image/png;base64,QUJD"
        );
    }

    #[test]
    fn status_mapping_classifies_errors() {
        assert!(matches!(
            OpenAiCompatClient::map_status(StatusCode::TOO_MANY_REQUESTS, None, String::new()),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            OpenAiCompatClient::map_status(StatusCode::BAD_GATEWAY, None, String::new()),
            LlmError::Transient(_)
        ));
        assert!(matches!(
            OpenAiCompatClient::map_status(StatusCode::UNAUTHORIZED, None, String::new()),
            LlmError::Authentication(_)
        ));
    }

    #[test]
    fn wire_response_deserializes() {
        let raw = r#"{
            "model": "gpt-4o",
            "choices": [{"message": {"content": "{\"question_numbers\": []}"}}],
            "usage": {"prompt_tokens": 900, "completion_tokens": 120}
        }"#;
        let parsed: WireResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices.len(), 1);
        assert_eq!(parsed.usage.unwrap().completion_tokens, 120);
    }
}
