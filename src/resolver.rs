//! Tiered configuration resolution.
//!
//! A configuration record overrides a topic's model, template, and sampling
//! parameters for one subscription tier. Resolution falls back from the
//! tier-specific record to the tier-null default, validates references, and
//! caches the result for 15 minutes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::TtlCache;
use crate::clock::SharedClock;
use crate::error::{ResolverError, StoreError};
use crate::llm::ModelRegistry;
use crate::store::{KVStore, tables};
use crate::templates::TemplateService;

const CACHE_TTL: Duration = Duration::from_secs(15 * 60);
const CACHE_CAPACITY: u64 = 10_000;

/// Tier-specific override of a topic's execution parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub config_id: String,
    pub interaction_code: String,
    /// `None` is the default tier every other tier falls back to.
    pub tier: Option<String>,
    pub model_code: String,
    pub template_id: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub is_active: bool,
    pub effective_from: Option<DateTime<Utc>>,
    pub effective_until: Option<DateTime<Utc>>,
}

impl Configuration {
    fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        if self.effective_from.is_some_and(|from| now < from) {
            return false;
        }
        if self.effective_until.is_some_and(|until| now >= until) {
            return false;
        }
        true
    }
}

fn cache_key(interaction_code: &str, tier: Option<&str>) -> String {
    format!("cfg:{}:{}", interaction_code, tier.unwrap_or("*"))
}

/// Resolves the effective configuration for (interaction_code, tier).
pub struct ConfigResolver {
    store: Arc<dyn KVStore>,
    clock: SharedClock,
    models: Arc<ModelRegistry>,
    templates: Arc<TemplateService>,
    cache: TtlCache<String, Configuration>,
}

impl ConfigResolver {
    pub fn new(
        store: Arc<dyn KVStore>,
        clock: SharedClock,
        models: Arc<ModelRegistry>,
        templates: Arc<TemplateService>,
    ) -> Self {
        Self {
            store,
            clock,
            models,
            templates,
            cache: TtlCache::new(CACHE_CAPACITY, CACHE_TTL),
        }
    }

    /// Resolve with tier fallback.
    ///
    /// A record resolved through fallback is cached under both the requested
    /// tier key and the default key, so the next lookup on either hits.
    pub async fn resolve(
        &self,
        interaction_code: &str,
        tier: Option<&str>,
    ) -> Result<Configuration, ResolverError> {
        let requested_key = cache_key(interaction_code, tier);
        if let Some(config) = self.cache.get(&requested_key) {
            return Ok(config);
        }

        if let Some(config) = self.lookup(interaction_code, tier).await? {
            self.validate(&config).await?;
            self.cache.insert(requested_key, config.clone());
            return Ok(config);
        }

        if tier.is_some() {
            if let Some(config) = self.lookup(interaction_code, None).await? {
                self.validate(&config).await?;
                self.cache.insert(requested_key, config.clone());
                self.cache
                    .insert(cache_key(interaction_code, None), config.clone());
                tracing::debug!(
                    interaction_code,
                    ?tier,
                    config_id = %config.config_id,
                    "resolved configuration via default-tier fallback"
                );
                return Ok(config);
            }
        }

        Err(ResolverError::NotFound {
            interaction_code: interaction_code.to_string(),
            tier: tier.map(String::from),
        })
    }

    /// Evict a cached resolution (admin mutation hook).
    pub fn invalidate(&self, interaction_code: &str, tier: Option<&str>) {
        self.cache.invalidate(&cache_key(interaction_code, tier));
    }

    async fn lookup(
        &self,
        interaction_code: &str,
        tier: Option<&str>,
    ) -> Result<Option<Configuration>, ResolverError> {
        let now = self.clock.now();
        for (_, doc) in self.store.scan(tables::CONFIGURATIONS).await? {
            let Ok(config) = serde_json::from_value::<Configuration>(doc) else {
                continue;
            };
            if config.interaction_code == interaction_code
                && config.tier.as_deref() == tier
                && config.is_effective_at(now)
            {
                return Ok(Some(config));
            }
        }
        Ok(None)
    }

    async fn validate(&self, config: &Configuration) -> Result<(), ResolverError> {
        if !self.models.contains(&config.model_code) {
            return Err(ResolverError::InvalidReference {
                config_id: config.config_id.clone(),
                reason: format!("model '{}' is not registered", config.model_code),
            });
        }
        // Metadata lookup fails for missing or inactive templates.
        self.templates.metadata(&config.template_id).await?;
        Ok(())
    }

    /// Store a configuration record (admin seeding path).
    pub async fn put(&self, config: &Configuration) -> Result<(), ResolverError> {
        let doc = serde_json::to_value(config).map_err(StoreError::from)?;
        self.store
            .put(tables::CONFIGURATIONS, &config.config_id, doc)
            .await?;
        self.invalidate(&config.interaction_code, config.tier.as_deref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::llm::{ModelCapabilities, ScriptedProvider};
    use crate::store::{MemoryBlobStore, MemoryStore};
    use crate::templates::TemplateRecord;

    async fn fixture() -> (ConfigResolver, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.put_text("prompts/default", "Hello {{ name }}.").await;

        let record = TemplateRecord {
            template_id: "tmpl-default".into(),
            template_code: "DEFAULT".into(),
            interaction_code: "goal-setting".into(),
            version: 1,
            blob_ref: "prompts/default".into(),
            required_parameters: vec![],
            is_active: true,
        };
        store
            .put(
                tables::TEMPLATES,
                "tmpl-default",
                serde_json::to_value(&record).unwrap(),
            )
            .await
            .unwrap();

        let templates = Arc::new(TemplateService::new(store.clone(), blobs));
        let mut models = ModelRegistry::new();
        models.register(
            "gpt-4o",
            ModelCapabilities {
                streaming: true,
                max_context_tokens: 128_000,
            },
            Arc::new(ScriptedProvider::new()),
        );

        let resolver = ConfigResolver::new(
            store.clone(),
            Arc::new(ManualClock::default()),
            Arc::new(models),
            templates,
        );
        (resolver, store)
    }

    fn config(config_id: &str, tier: Option<&str>) -> Configuration {
        Configuration {
            config_id: config_id.into(),
            interaction_code: "goal-setting".into(),
            tier: tier.map(String::from),
            model_code: "gpt-4o".into(),
            template_id: "tmpl-default".into(),
            temperature: 0.5,
            max_tokens: 800,
            is_active: true,
            effective_from: None,
            effective_until: None,
        }
    }

    #[tokio::test]
    async fn tier_specific_record_wins() {
        let (resolver, _) = fixture().await;
        resolver.put(&config("cfg-default", None)).await.unwrap();
        resolver
            .put(&config("cfg-enterprise", Some("enterprise")))
            .await
            .unwrap();

        let resolved = resolver
            .resolve("goal-setting", Some("enterprise"))
            .await
            .unwrap();
        assert_eq!(resolved.config_id, "cfg-enterprise");
    }

    #[tokio::test]
    async fn missing_tier_falls_back_to_default_and_caches_both_keys() {
        let (resolver, store) = fixture().await;
        resolver.put(&config("cfg-default", None)).await.unwrap();

        let resolved = resolver
            .resolve("goal-setting", Some("enterprise"))
            .await
            .unwrap();
        assert_eq!(resolved.config_id, "cfg-default");

        // Both keys now hit the cache: deleting the row changes nothing.
        store
            .delete(tables::CONFIGURATIONS, "cfg-default")
            .await
            .unwrap();
        resolver
            .resolve("goal-setting", Some("enterprise"))
            .await
            .unwrap();
        resolver.resolve("goal-setting", None).await.unwrap();
    }

    #[tokio::test]
    async fn nothing_configured_is_not_found() {
        let (resolver, _) = fixture().await;
        let err = resolver
            .resolve("goal-setting", Some("starter"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::NotFound { .. }));
    }

    #[tokio::test]
    async fn invalid_model_reference_is_rejected() {
        let (resolver, _) = fixture().await;
        let mut bad = config("cfg-bad", None);
        bad.model_code = "unregistered".into();
        resolver.put(&bad).await.unwrap();

        let err = resolver.resolve("goal-setting", None).await.unwrap_err();
        assert!(matches!(err, ResolverError::InvalidReference { .. }));
    }

    #[tokio::test]
    async fn inactive_and_expired_records_are_skipped() {
        let (resolver, _) = fixture().await;

        let mut inactive = config("cfg-inactive", None);
        inactive.is_active = false;
        resolver.put(&inactive).await.unwrap();

        let mut expired = config("cfg-expired", None);
        expired.effective_until = Some(Utc::now() - chrono::Duration::days(1));
        resolver.put(&expired).await.unwrap();

        let err = resolver.resolve("goal-setting", None).await.unwrap_err();
        assert!(matches!(err, ResolverError::NotFound { .. }));
    }

    #[tokio::test]
    async fn put_evicts_stale_cache() {
        let (resolver, _) = fixture().await;
        resolver.put(&config("cfg-v1", None)).await.unwrap();
        resolver.resolve("goal-setting", None).await.unwrap();

        let mut v2 = config("cfg-v1", None);
        v2.max_tokens = 2048;
        resolver.put(&v2).await.unwrap();

        let resolved = resolver.resolve("goal-setting", None).await.unwrap();
        assert_eq!(resolved.max_tokens, 2048);
    }
}
