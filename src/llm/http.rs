//! OpenAI-compatible chat completions provider.
//!
//! One instance is bound per model code at wiring time; vendor-specific
//! protocols beyond this generic surface stay outside the core.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, GenerateReply, GenerateRequest, ModelProvider, Role, parse_json_output,
};
use crate::llm::schema::validate_schema;

const PROVIDER_NAME: &str = "chat_completions";

/// Generic chat-completions client.
#[derive(Debug)]
pub struct ChatCompletionsProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl ChatCompletionsProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
        }
    }

    fn api_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn send_request(&self, body: &ChatCompletionRequest) -> Result<String, LlmError> {
        let url = self.api_url();
        tracing::debug!(model = %self.model, %url, "sending chat completion request");

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "chat completion request failed");
                LlmError::RequestFailed {
                    provider: PROVIDER_NAME.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let status = response.status();
        let response_text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            if status.as_u16() == 401 {
                return Err(LlmError::AuthFailed {
                    provider: PROVIDER_NAME.to_string(),
                });
            }
            if status.as_u16() == 429 {
                return Err(LlmError::RateLimited {
                    provider: PROVIDER_NAME.to_string(),
                    retry_after: None,
                });
            }
            return Err(LlmError::RequestFailed {
                provider: PROVIDER_NAME.to_string(),
                reason: format!("HTTP {status}: {response_text}"),
            });
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&response_text).map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER_NAME.to_string(),
                reason: format!("JSON parse error: {e}"),
            })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER_NAME.to_string(),
                reason: "no choices in response".to_string(),
            })?;

        choice
            .message
            .and_then(|m| m.content)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER_NAME.to_string(),
                reason: "choice carried no content".to_string(),
            })
    }

    fn build_request(&self, req: &GenerateRequest) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: req.to_messages().iter().map(Into::into).collect(),
            temperature: req.sampling.temperature,
            max_tokens: req.sampling.max_tokens,
            top_p: req.sampling.top_p,
        }
    }
}

#[async_trait]
impl ModelProvider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateReply, LlmError> {
        let body = self.build_request(&req);
        let text = self.send_request(&body).await?;
        Ok(GenerateReply { text })
    }

    async fn generate_structured(
        &self,
        schema: &Value,
        req: GenerateRequest,
    ) -> Result<Value, LlmError> {
        let mut constrained = req;
        constrained.user = format!(
            "{}\n\nRespond with a single JSON object matching this schema, and nothing else:\n{}",
            constrained.user, schema
        );

        let body = self.build_request(&constrained);
        let text = self.send_request(&body).await?;

        let parsed = parse_json_output(&text)?;
        validate_schema(schema, &parsed).map_err(|reason| LlmError::StructuredValidation {
            reason,
            raw: text,
        })?;
        Ok(parsed)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}
