/// Request caching for the read API.
///
/// An LRU of JSON responses with per-entry TTL. Heavy endpoints
/// (richlist, dashboard, producers) compute through it; point lookups go
/// straight to the store.

use lru::LruCache;
use serde_json::Value;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CachedEntry {
    value: Value,
    expires_at: Instant,
}

impl CachedEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

pub struct ApiCache {
    json: Arc<RwLock<LruCache<String, CachedEntry>>>,
}

impl ApiCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            json: Arc::new(RwLock::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1"),
            ))),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut cache = self.json.write().await;
        match cache.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, key: String, value: Value, ttl: Duration) {
        let mut cache = self.json.write().await;
        cache.put(
            key,
            CachedEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Serve from cache or compute and remember.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = compute().await?;
        self.put(key.to_string(), value.clone(), ttl).await;
        Ok(value)
    }
}

impl Default for ApiCache {
    fn default() -> Self {
        Self::new(5_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn caches_until_ttl() {
        let cache = ApiCache::new(8);
        let mut computed = 0u32;

        for _ in 0..3 {
            let value: Result<Value, std::convert::Infallible> = cache
                .get_or_compute("k", Duration::from_secs(60), || {
                    computed += 1;
                    async { Ok(json!({"n": 1})) }
                })
                .await;
            assert_eq!(value.unwrap()["n"], 1);
        }
        assert_eq!(computed, 1);
    }

    #[tokio::test]
    async fn expired_entries_recompute() {
        let cache = ApiCache::new(8);
        cache
            .put("k".into(), json!(1), Duration::from_millis(0))
            .await;
        assert!(cache.get("k").await.is_none());
    }
}
