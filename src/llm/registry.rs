//! Static model registry: model code → provider + capability flags.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::LlmError;
use crate::llm::ModelProvider;

/// What a registered model can do. The core never relies on streaming; the
/// flags exist for callers sizing prompts and picking transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub streaming: bool,
    pub max_context_tokens: u32,
}

struct ModelEntry {
    capabilities: ModelCapabilities,
    provider: Arc<dyn ModelProvider>,
}

/// Maps model codes to bound provider instances.
///
/// Built once at wiring time and read-only afterwards.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelEntry>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        model_code: impl Into<String>,
        capabilities: ModelCapabilities,
        provider: Arc<dyn ModelProvider>,
    ) {
        self.models.insert(
            model_code.into(),
            ModelEntry {
                capabilities,
                provider,
            },
        );
    }

    pub fn contains(&self, model_code: &str) -> bool {
        self.models.contains_key(model_code)
    }

    pub fn capabilities(&self, model_code: &str) -> Option<ModelCapabilities> {
        self.models.get(model_code).map(|e| e.capabilities)
    }

    pub fn provider_for(&self, model_code: &str) -> Result<Arc<dyn ModelProvider>, LlmError> {
        self.models
            .get(model_code)
            .map(|e| Arc::clone(&e.provider))
            .ok_or_else(|| LlmError::UnknownModel {
                model_code: model_code.to_string(),
            })
    }

    pub fn model_codes(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedProvider;

    #[test]
    fn lookup_and_unknown_code() {
        let mut registry = ModelRegistry::new();
        registry.register(
            "gpt-4o",
            ModelCapabilities {
                streaming: true,
                max_context_tokens: 128_000,
            },
            Arc::new(ScriptedProvider::new()),
        );

        assert!(registry.contains("gpt-4o"));
        assert!(registry.provider_for("gpt-4o").is_ok());
        assert_eq!(
            registry.capabilities("gpt-4o").unwrap().max_context_tokens,
            128_000
        );

        let err = registry.provider_for("nope").unwrap_err();
        assert!(matches!(err, LlmError::UnknownModel { model_code } if model_code == "nope"));
    }
}
