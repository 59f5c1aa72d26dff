//! Topic blueprints.
//!
//! A topic describes one interaction: which model, which prompt templates,
//! which named inputs it accepts, and how final messages are detected and
//! extracted. Topics are administered externally; the core reads them from
//! the KV store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, TopicError};
use crate::jobs::JobKind;
use crate::store::{KVStore, tables};

/// End-of-conversation marker the model is prompted to emit on its last turn.
pub const DEFAULT_END_MARKER: &str = "[SESSION_COMPLETE]";

/// Template bindings for a topic's prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRefs {
    /// Template for the system prompt.
    pub system: String,
    /// Template for the per-turn user prompt.
    pub user: String,
    /// Template for the structured-extraction prompt, when the topic
    /// extracts a result from final messages.
    pub extraction: Option<String>,
}

/// Which named inputs a topic accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

/// Execution blueprint for one interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub topic_id: String,
    pub kind: JobKind,
    /// Binding key for tier configuration overrides.
    pub interaction_code: String,
    pub model_code: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub prompt_refs: PromptRefs,
    pub param_schema: ParamSchema,
    /// Schema for structured extraction on final messages.
    pub result_schema: Option<Value>,
    /// Default turn budget for sessions started on this topic. 0 = unlimited.
    pub default_max_turns: u32,
    /// Marker the terminator looks for; defaults to [`DEFAULT_END_MARKER`].
    pub end_marker: Option<String>,
    /// Pass-through for aggregation consumers; unused by the core.
    pub aggregation_period_count: Option<u32>,
    pub is_active: bool,
}

impl Topic {
    pub fn end_marker(&self) -> &str {
        self.end_marker.as_deref().unwrap_or(DEFAULT_END_MARKER)
    }

    /// Check `input` against the parameter schema.
    pub fn validate_params(&self, input: &Value) -> Result<(), TopicError> {
        for name in &self.param_schema.required {
            let present = input
                .get(name)
                .map(|v| !v.is_null())
                .unwrap_or(false);
            if !present {
                return Err(TopicError::MissingParam {
                    id: self.topic_id.clone(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// KV-store backed topic lookup.
pub struct TopicRegistry {
    store: Arc<dyn KVStore>,
}

impl TopicRegistry {
    pub fn new(store: Arc<dyn KVStore>) -> Self {
        Self { store }
    }

    /// Fetch an active topic.
    pub async fn get(&self, topic_id: &str) -> Result<Topic, TopicError> {
        let doc = self
            .store
            .get(tables::TOPICS, topic_id)
            .await?
            .ok_or_else(|| TopicError::NotFound {
                id: topic_id.to_string(),
            })?;

        let topic: Topic = serde_json::from_value(doc).map_err(StoreError::from)?;
        if !topic.is_active {
            return Err(TopicError::Inactive {
                id: topic_id.to_string(),
            });
        }
        Ok(topic)
    }

    /// Upsert a topic (admin seeding path).
    pub async fn put(&self, topic: &Topic) -> Result<(), TopicError> {
        let doc = serde_json::to_value(topic).map_err(StoreError::from)?;
        self.store.put(tables::TOPICS, &topic.topic_id, doc).await?;
        Ok(())
    }
}
