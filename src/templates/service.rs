//! Template lookup and rendering with layered caches.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use minijinja::Environment;
use serde_json::Value;

use crate::cache::TtlCache;
use crate::error::{StoreError, TemplateError};
use crate::store::{BlobStore, KVStore, tables};
use crate::templates::TemplateRecord;

const METADATA_TTL: Duration = Duration::from_secs(30 * 60);
const CONTENT_TTL: Duration = Duration::from_secs(30 * 60);
const RENDERED_TTL: Duration = Duration::from_secs(5 * 60);

const CACHE_CAPACITY: u64 = 10_000;

/// Renders prompt templates.
///
/// Three caches, per the cache policy: metadata and raw content for 30
/// minutes, rendered output for 5 minutes keyed by (template id, parameter
/// hash). Admin mutations call [`TemplateService::invalidate`]; stale reads
/// up to the TTL are acceptable.
pub struct TemplateService {
    store: Arc<dyn KVStore>,
    blobs: Arc<dyn BlobStore>,
    metadata_cache: TtlCache<String, TemplateRecord>,
    content_cache: TtlCache<String, String>,
    rendered_cache: TtlCache<(String, u64), String>,
}

impl TemplateService {
    pub fn new(store: Arc<dyn KVStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            blobs,
            metadata_cache: TtlCache::new(CACHE_CAPACITY, METADATA_TTL),
            content_cache: TtlCache::new(CACHE_CAPACITY, CONTENT_TTL),
            rendered_cache: TtlCache::new(CACHE_CAPACITY, RENDERED_TTL),
        }
    }

    /// Fetch template metadata, cached.
    pub async fn metadata(&self, template_id: &str) -> Result<TemplateRecord, TemplateError> {
        if let Some(record) = self.metadata_cache.get(&template_id.to_string()) {
            return Ok(record);
        }

        let doc = self
            .store
            .get(tables::TEMPLATES, template_id)
            .await?
            .ok_or_else(|| TemplateError::NotFound {
                id: template_id.to_string(),
            })?;
        let record: TemplateRecord = serde_json::from_value(doc).map_err(StoreError::from)?;

        if !record.is_active {
            return Err(TemplateError::NotFound {
                id: template_id.to_string(),
            });
        }

        self.metadata_cache
            .insert(template_id.to_string(), record.clone());
        Ok(record)
    }

    /// Render a template with the given named parameters.
    pub async fn render(
        &self,
        template_id: &str,
        params: &Value,
    ) -> Result<String, TemplateError> {
        let rendered_key = (template_id.to_string(), hash_params(params));
        if let Some(rendered) = self.rendered_cache.get(&rendered_key) {
            return Ok(rendered);
        }

        let record = self.metadata(template_id).await?;

        for name in &record.required_parameters {
            let present = params.get(name).map(|v| !v.is_null()).unwrap_or(false);
            if !present {
                return Err(TemplateError::MissingParameter {
                    id: template_id.to_string(),
                    name: name.clone(),
                });
            }
        }

        let source = self.content(&record).await?;
        let rendered = render_source(template_id, &source, params)?;

        self.rendered_cache.insert(rendered_key, rendered.clone());
        Ok(rendered)
    }

    /// Evict a template from every cache layer (admin mutation hook).
    pub fn invalidate(&self, template_id: &str, blob_ref: Option<&str>) {
        self.metadata_cache.invalidate(&template_id.to_string());
        if let Some(blob_ref) = blob_ref {
            self.content_cache.invalidate(&blob_ref.to_string());
        }
        // Rendered entries are keyed by parameter hash and cannot be
        // enumerated; their 5-minute TTL bounds the staleness.
    }

    async fn content(&self, record: &TemplateRecord) -> Result<String, TemplateError> {
        if let Some(content) = self.content_cache.get(&record.blob_ref) {
            return Ok(content);
        }

        let bytes = self
            .blobs
            .get(&record.blob_ref)
            .await?
            .ok_or_else(|| TemplateError::ContentMissing {
                blob_ref: record.blob_ref.clone(),
            })?;
        let content = String::from_utf8_lossy(&bytes).into_owned();

        self.content_cache
            .insert(record.blob_ref.clone(), content.clone());
        Ok(content)
    }
}

fn render_source(template_id: &str, source: &str, params: &Value) -> Result<String, TemplateError> {
    let mut env = Environment::new();
    env.add_template(template_id, source)
        .map_err(|e| TemplateError::Syntax {
            id: template_id.to_string(),
            reason: e.to_string(),
        })?;

    let template = env
        .get_template(template_id)
        .map_err(|e| TemplateError::Syntax {
            id: template_id.to_string(),
            reason: e.to_string(),
        })?;

    template
        .render(minijinja::value::Value::from_serialize(params))
        .map_err(|e| TemplateError::Render {
            id: template_id.to_string(),
            reason: e.to_string(),
        })
}

fn hash_params(params: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    // Canonical form via serde_json keeps equal maps hashing equal.
    serde_json::to_string(params)
        .unwrap_or_default()
        .hash(&mut hasher);
    hasher.finish()
}
