//! Storage capability traits.
//!
//! The core never talks to a concrete storage engine; it goes through
//! [`KVStore`] (JSON documents with conditional writes) and [`BlobStore`]
//! (opaque content addressed by reference). Production deployments back these
//! with a managed document store and object storage; tests and local runs use
//! the in-memory implementations.
//!
//! Access patterns the backing engine must support:
//! - Jobs: primary key `job_id`, TTL attribute on `ttl_at`.
//! - Sessions: primary key `session_id`, secondary index on
//!   `(tenant_id, user_id, topic_id, status)`.
//! - Configurations: primary key `config_id`, secondary index on
//!   `(interaction_code, tier, is_active)`.
//! - Templates: primary key `template_id`, secondary index on
//!   `(interaction_code, template_code, is_active)`.

mod memory;

pub use memory::{MemoryBlobStore, MemoryStore};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::error::StoreError;

/// Condition attached to a write.
#[derive(Debug, Clone)]
pub enum Precondition {
    /// Write only if no document exists under the key.
    Absent,
    /// Write only if the stored document's `field` currently equals `value`.
    FieldEquals { field: String, value: Value },
}

impl Precondition {
    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// JSON document store with conditional writes.
///
/// All registry and state-machine mutations funnel through `put_if`; the
/// returned `false` on a failed precondition is how compare-and-set losers
/// learn they lost.
#[async_trait]
pub trait KVStore: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Unconditional upsert.
    async fn put(&self, table: &str, key: &str, doc: Value) -> Result<(), StoreError>;

    /// Conditional write. Returns `Ok(false)` when the precondition fails.
    async fn put_if(
        &self,
        table: &str,
        key: &str,
        doc: Value,
        precondition: Precondition,
    ) -> Result<bool, StoreError>;

    /// Delete a document. Returns whether anything was removed.
    async fn delete(&self, table: &str, key: &str) -> Result<bool, StoreError>;

    /// Full scan of a table.
    ///
    /// In-memory convenience; production backends serve the equivalent
    /// queries from the secondary indexes listed in the module docs.
    async fn scan(&self, table: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

/// Opaque content store for prompt text.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, blob_ref: &str) -> Result<Option<Bytes>, StoreError>;

    async fn put(&self, blob_ref: &str, content: Bytes) -> Result<(), StoreError>;
}

/// Table names used by the core.
pub mod tables {
    pub const JOBS: &str = "jobs";
    pub const SESSIONS: &str = "sessions";
    pub const TOPICS: &str = "topics";
    pub const CONFIGURATIONS: &str = "configurations";
    pub const TEMPLATES: &str = "templates";
}
