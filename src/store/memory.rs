//! In-memory store implementations for tests and local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{BlobStore, KVStore, Precondition};

/// In-memory JSON document store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KVStore for MemoryStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn put(&self, table: &str, key: &str, doc: Value) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), doc);
        Ok(())
    }

    async fn put_if(
        &self,
        table: &str,
        key: &str,
        doc: Value,
        precondition: Precondition,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let table = tables.entry(table.to_string()).or_default();

        let holds = match &precondition {
            Precondition::Absent => !table.contains_key(key),
            Precondition::FieldEquals { field, value } => table
                .get(key)
                .and_then(|existing| existing.get(field))
                .is_some_and(|current| current == value),
        };

        if holds {
            table.insert(key.to_string(), doc);
        }
        Ok(holds)
    }

    async fn delete(&self, table: &str, key: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .get_mut(table)
            .is_some_and(|t| t.remove(key).is_some()))
    }

    async fn scan(&self, table: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob from a string, returning the ref that was stored.
    pub async fn put_text(&self, blob_ref: &str, text: &str) {
        self.blobs
            .write()
            .await
            .insert(blob_ref.to_string(), Bytes::copy_from_slice(text.as_bytes()));
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, blob_ref: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.blobs.read().await.get(blob_ref).cloned())
    }

    async fn put(&self, blob_ref: &str, content: Bytes) -> Result<(), StoreError> {
        self.blobs
            .write()
            .await
            .insert(blob_ref.to_string(), content);
        Ok(())
    }
}
