// In-memory resource cache with TTL expiry, keyed by (resource, partition).
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cache contract consumed by the coalescing engine.
///
/// Values are full rows serialized as JSON. A `None` from `get` is a miss;
/// the engine reacts by re-fetching the row from the repository
/// (read-through) and calling `set` (write-through).
#[async_trait]
pub trait ResourceCache: Send + Sync {
    async fn get(&self, resource_key: &str, partition_key: &str) -> Option<String>;
    async fn set(&self, resource_key: &str, partition_key: &str, value: String, ttl: Duration);
    async fn delete(&self, resource_key: &str, partition_key: &str) -> Option<String>;
    /// Drop every entry. Intended for tests and operator tooling only.
    async fn clear(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    resource_key: String,
    partition_key: String,
}

impl CacheKey {
    fn new(resource_key: &str, partition_key: &str) -> Self {
        Self {
            resource_key: resource_key.to_string(),
            partition_key: partition_key.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// In-memory cache with per-entry TTL.
///
/// Every `set` refreshes the expiration; reads lazily evict expired entries
/// so no background sweeper is needed. Suitable for single-process
/// deployments and tests; a shared cache server would live behind the same
/// [`ResourceCache`] trait.
#[derive(Debug, Default)]
pub struct EphemeralResourceCache {
    // RwLock allows concurrent readers while updates take exclusive access.
    inner: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl EphemeralResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl ResourceCache for EphemeralResourceCache {
    async fn get(&self, resource_key: &str, partition_key: &str) -> Option<String> {
        // Take a write lock so we can evict expired entries.
        let mut guard = self.inner.write().await;
        let key = CacheKey::new(resource_key, partition_key);
        if let Some(entry) = guard.get(&key) {
            // Lazy-expire on read to avoid a background sweeper.
            if Instant::now() >= entry.expires_at {
                guard.remove(&key);
                return None;
            }
            return Some(entry.value.clone());
        }
        None
    }

    async fn set(&self, resource_key: &str, partition_key: &str, value: String, ttl: Duration) {
        // Compute expiry once so reads only compare Instants.
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner
            .write()
            .await
            .insert(CacheKey::new(resource_key, partition_key), entry);
    }

    async fn delete(&self, resource_key: &str, partition_key: &str) -> Option<String> {
        self.inner
            .write()
            .await
            .remove(&CacheKey::new(resource_key, partition_key))
            .map(|entry| entry.value)
    }

    async fn clear(&self) {
        self.inner.write().await.clear();
    }
}
