//! Thread-safe map whose entries expire a fixed time after they were written.
//!
//! Used by the event predicates to remember the projection of the last
//! admitted version of each object. Expired entries are invisible to `get`
//! and evicted by the underlying `moka` cache.

use moka::sync::Cache;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

/// Map with expiring entries
pub struct ExpiringCache<K, V> {
    entries: Cache<K, V>,
    ttl: Duration,
}

impl<K, V> fmt::Debug for ExpiringCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().time_to_live(ttl).build(),
            ttl,
        }
    }

    /// Value stored under `key`, unless absent or expired
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key)
    }

    /// Store `value` under `key`, restarting its time to live
    pub fn set(&self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    /// Remove the entry for `key`
    pub fn delete(&self, key: &K) {
        self.entries.invalidate(key);
    }
}
