//! TTL cache capability.
//!
//! Thin wrapper over `moka` so cache policy (capacity + TTL) is fixed at
//! construction and call sites stay oblivious to the engine. These caches are
//! the only process-wide mutable state in the core; admin mutations evict,
//! and stale reads up to the TTL are acceptable.

use std::hash::Hash;
use std::time::Duration;

use moka::sync::Cache;

/// Cache with a fixed time-to-live per entry.
#[derive(Clone)]
pub struct TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Cache<K, V>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value);
    }

    /// Evict a single entry (admin-driven invalidation).
    pub fn invalidate(&self, key: &K) {
        self.inner.invalidate(key);
    }
}
