//! Model provider capability.
//!
//! Providers are selected per model code through a static [`ModelRegistry`]
//! built at wiring time. The core only needs whole-message generation; the
//! generic chat-completions client covers any OpenAI-compatible endpoint and
//! the scripted provider covers tests and offline runs.

mod http;
mod provider;
mod registry;
mod schema;
mod scripted;

pub use http::ChatCompletionsProvider;
pub use provider::{
    ChatMessage, GenerateReply, GenerateRequest, ModelProvider, Role, SamplingParams,
    parse_json_output,
};
pub use registry::{ModelCapabilities, ModelRegistry};
pub use schema::validate_schema;
pub use scripted::ScriptedProvider;

use std::sync::Arc;

use crate::config::LlmConfig;

/// Model codes the default wiring knows about.
const DEFAULT_MODELS: &[(&str, ModelCapabilities)] = &[
    (
        "gpt-4o",
        ModelCapabilities {
            streaming: true,
            max_context_tokens: 128_000,
        },
    ),
    (
        "gpt-4o-mini",
        ModelCapabilities {
            streaming: true,
            max_context_tokens: 128_000,
        },
    ),
    (
        "gpt-4.1",
        ModelCapabilities {
            streaming: true,
            max_context_tokens: 1_000_000,
        },
    ),
];

/// Build the registry for the configured endpoint.
///
/// Without an API key the registry comes back empty; callers are expected to
/// register scripted providers instead.
pub fn default_registry(config: &LlmConfig) -> ModelRegistry {
    let mut registry = ModelRegistry::new();

    let Some(api_key) = config.api_key.clone() else {
        tracing::warn!("no LLM API key configured; model registry is empty");
        return registry;
    };

    for (code, capabilities) in DEFAULT_MODELS {
        tracing::info!(model_code = code, "registering chat completions model");
        registry.register(
            *code,
            *capabilities,
            Arc::new(ChatCompletionsProvider::new(
                config.base_url.clone(),
                api_key.clone(),
                *code,
                config.deadline,
            )),
        );
    }
    registry
}
