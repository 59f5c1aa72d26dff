//! Topic execution engine.
//!
//! Turns a (topic, params, history) triple into a provider invocation:
//! resolve the tier configuration, render prompts, generate under a
//! deadline, detect final messages, and run structured extraction on them.

mod terminator;

pub use terminator::{Terminal, evaluate as evaluate_terminal};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::{
    ErrorCode, LlmError, ResolverError, TemplateError, TopicError,
};
use crate::llm::{ChatMessage, GenerateReply, GenerateRequest, ModelProvider, ModelRegistry, SamplingParams};
use crate::resolver::ConfigResolver;
use crate::templates::TemplateService;
use crate::topics::Topic;

/// Failure during topic execution, classified for the terminal envelope.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl EngineError {
    /// Terminal error code for `message.failed`.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            EngineError::Topic(TopicError::MissingParam { .. }) => ErrorCode::ParameterValidation,
            EngineError::Topic(TopicError::Store(_)) => ErrorCode::InternalError,
            EngineError::Topic(_) => ErrorCode::InternalError,
            // A record whose references fail validation is as unusable as a
            // missing one.
            EngineError::Resolver(ResolverError::Store(_)) => ErrorCode::InternalError,
            EngineError::Resolver(_) => ErrorCode::ConfigurationNotFound,
            EngineError::Template(TemplateError::Store(_)) => ErrorCode::InternalError,
            EngineError::Template(_) => ErrorCode::ParameterValidation,
            EngineError::Llm(e) => e.error_code(),
        }
    }
}

/// Result of one coaching turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub message: String,
    pub is_final: bool,
    /// Extraction output on final turns; carries `parse_error` /
    /// `validation_error` fields when extraction itself failed.
    pub result: Option<Value>,
}

/// Result of a single-shot analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub message: String,
    pub result: Option<Value>,
}

/// Orchestrates configuration, templates, and providers for one invocation.
pub struct ExecutionEngine {
    resolver: Arc<ConfigResolver>,
    templates: Arc<TemplateService>,
    models: Arc<ModelRegistry>,
    deadline: Duration,
}

impl ExecutionEngine {
    pub fn new(
        resolver: Arc<ConfigResolver>,
        templates: Arc<TemplateService>,
        models: Arc<ModelRegistry>,
        deadline: Duration,
    ) -> Self {
        Self {
            resolver,
            templates,
            models,
            deadline,
        }
    }

    /// Execute one conversation turn.
    ///
    /// `history` is the conversation so far, excluding the user message being
    /// processed (that arrives rendered through the user template).
    /// `next_turn` is the turn number this reply becomes.
    pub async fn execute_turn(
        &self,
        topic: &Topic,
        tier: Option<&str>,
        params: &Value,
        history: Vec<ChatMessage>,
        next_turn: u32,
        max_turns: u32,
    ) -> Result<TurnOutcome, EngineError> {
        topic.validate_params(params)?;
        let config = self.resolver.resolve(&topic.interaction_code, tier).await?;

        let system = self.templates.render(&topic.prompt_refs.system, params).await?;
        let user = self.templates.render(&config.template_id, params).await?;

        let provider = self.models.provider_for(&config.model_code)?;
        let request = GenerateRequest {
            system: Some(system),
            history,
            user,
            sampling: SamplingParams {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                top_p: topic.top_p,
            },
        };

        let reply = self.generate(provider.as_ref(), request.clone()).await?;
        let terminal = evaluate_terminal(&reply.text, next_turn, max_turns, topic.end_marker());

        let result = if terminal.is_final {
            self.extract(topic, params, &provider, &request, &terminal.message)
                .await
        } else {
            None
        };

        Ok(TurnOutcome {
            message: terminal.message,
            is_final: terminal.is_final,
            result,
        })
    }

    /// Execute a single-shot analysis.
    pub async fn execute_analysis(
        &self,
        topic: &Topic,
        tier: Option<&str>,
        params: &Value,
    ) -> Result<AnalysisOutcome, EngineError> {
        topic.validate_params(params)?;
        let config = self.resolver.resolve(&topic.interaction_code, tier).await?;

        let system = self.templates.render(&topic.prompt_refs.system, params).await?;
        let user = self.templates.render(&config.template_id, params).await?;

        let provider = self.models.provider_for(&config.model_code)?;
        let request = GenerateRequest {
            system: Some(system),
            history: Vec::new(),
            user,
            sampling: SamplingParams {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                top_p: topic.top_p,
            },
        };

        let reply = self.generate(provider.as_ref(), request.clone()).await?;
        let result = self
            .extract(topic, params, &provider, &request, &reply.text)
            .await;

        Ok(AnalysisOutcome {
            message: reply.text.trim().to_string(),
            result,
        })
    }

    /// Structured extraction against the topic's result schema.
    ///
    /// Never fails the job: parse and validation problems are folded into the
    /// result value alongside the raw response.
    async fn extract(
        &self,
        topic: &Topic,
        params: &Value,
        provider: &Arc<dyn ModelProvider>,
        turn_request: &GenerateRequest,
        final_message: &str,
    ) -> Option<Value> {
        let schema = topic.result_schema.as_ref()?;

        let instruction = match &topic.prompt_refs.extraction {
            Some(template_id) => match self.templates.render(template_id, params).await {
                Ok(rendered) => rendered,
                Err(e) => {
                    tracing::warn!(error = %e, "extraction template failed to render");
                    return Some(json!({
                        "raw_response": final_message,
                        "parse_error": e.to_string(),
                    }));
                }
            },
            None => "Extract the structured result of this conversation.".to_string(),
        };

        let mut history = turn_request.history.clone();
        history.push(ChatMessage::user(&turn_request.user));
        history.push(ChatMessage::assistant(final_message));

        let request = GenerateRequest {
            system: turn_request.system.clone(),
            history,
            user: instruction,
            sampling: turn_request.sampling,
        };

        let extracted = tokio::time::timeout(
            self.deadline,
            provider.generate_structured(schema, request),
        )
        .await
        .unwrap_or_else(|_| {
            Err(LlmError::Timeout {
                provider: provider.name().to_string(),
                elapsed_ms: self.deadline.as_millis() as u64,
            })
        });

        match extracted {
            Ok(value) => Some(value),
            Err(LlmError::StructuredParse { reason, raw }) => Some(json!({
                "raw_response": raw,
                "parse_error": reason,
            })),
            Err(LlmError::StructuredValidation { reason, raw }) => Some(json!({
                "raw_response": raw,
                "validation_error": reason,
            })),
            Err(e) => {
                tracing::warn!(error = %e, "extraction call failed");
                Some(json!({
                    "raw_response": final_message,
                    "parse_error": e.to_string(),
                }))
            }
        }
    }

    async fn generate(
        &self,
        provider: &dyn ModelProvider,
        request: GenerateRequest,
    ) -> Result<GenerateReply, EngineError> {
        match tokio::time::timeout(self.deadline, provider.generate(request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::Llm(LlmError::Timeout {
                provider: provider.name().to_string(),
                elapsed_ms: self.deadline.as_millis() as u64,
            })),
        }
    }
}
