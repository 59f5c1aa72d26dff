//! Model provider trait and request/response types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;
use crate::llm::schema::validate_schema;

/// Message author roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling knobs passed through from topic/configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

/// A single generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// Rendered system prompt.
    pub system: Option<String>,
    /// Prior conversation turns, oldest first.
    pub history: Vec<ChatMessage>,
    /// Rendered prompt for the current user turn.
    pub user: String,
    pub sampling: SamplingParams,
}

impl GenerateRequest {
    /// Flatten into the message list providers expect.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if let Some(system) = &self.system {
            messages.push(ChatMessage::system(system));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(&self.user));
        messages
    }
}

/// A completed generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateReply {
    pub text: String,
}

/// Capability to run a model.
///
/// Deadlines are enforced by the caller (the execution engine wraps calls in
/// `tokio::time::timeout`); implementations should still bound their own
/// transport timeouts.
#[async_trait]
pub trait ModelProvider: Send + Sync + std::fmt::Debug {
    /// Provider identifier for logs and error tags.
    fn name(&self) -> &str;

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateReply, LlmError>;

    /// Constrained generation returning JSON that validates against `schema`.
    ///
    /// The default implementation runs a plain generation and parses the
    /// output; providers with native structured modes override it.
    async fn generate_structured(
        &self,
        schema: &Value,
        req: GenerateRequest,
    ) -> Result<Value, LlmError> {
        let reply = self.generate(req).await?;
        let parsed = parse_json_output(&reply.text)?;
        validate_schema(schema, &parsed).map_err(|reason| LlmError::StructuredValidation {
            reason,
            raw: reply.text.clone(),
        })?;
        Ok(parsed)
    }
}

/// Extract a JSON value from model output, tolerating markdown fences.
pub fn parse_json_output(text: &str) -> Result<Value, LlmError> {
    let trimmed = text.trim();
    let candidate = strip_fences(trimmed);

    serde_json::from_str(candidate).map_err(|e| LlmError::StructuredParse {
        reason: e.to_string(),
        raw: text.to_string(),
    })
}

fn strip_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line, then the closing fence.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().trim_end_matches("```").trim()
}
