//! Prompt templates: metadata in the KV store, content in the blob store,
//! rendering via minijinja with named parameters and conditional blocks.

mod service;

pub use service::TemplateService;

use serde::{Deserialize, Serialize};

/// Prompt metadata; the text itself lives in the blob store at `blob_ref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub template_id: String,
    pub template_code: String,
    pub interaction_code: String,
    pub version: u32,
    pub blob_ref: String,
    #[serde(default)]
    pub required_parameters: Vec<String>,
    pub is_active: bool,
}
