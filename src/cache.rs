//! Look-aside cache for read views.
//!
//! Reads consult the key-value store first and fall back to the loader on a
//! miss, writing the loaded value back with a short TTL. Every cache failure
//! (store error, undecodable payload) degrades to the loader: callers always
//! observe the same results with or without the cache, only latency differs.

use crate::config::CacheConfig;
use crate::error::Result;
use crate::kv::KeyValueStore;
use crate::types::{ScopeId, SubjectId, TokenId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Cache for availability listings and waiting-queue positions.
pub struct ViewCache {
    store: Arc<dyn KeyValueStore>,
    config: CacheConfig,
}

impl ViewCache {
    /// Create a cache over `store` with the configured TTLs and key prefix.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    fn availability_key(&self, scope_id: &ScopeId) -> String {
        format!("{}:availability:{scope_id}", self.config.key_prefix)
    }

    fn position_key(&self, subject_id: &SubjectId, token_id: &TokenId) -> String {
        format!("{}:position:{subject_id}:{token_id}", self.config.key_prefix)
    }

    /// Cached availability listing for a scope.
    ///
    /// # Errors
    ///
    /// Propagates only the loader's error; cache failures are logged and
    /// degrade to a direct load.
    pub async fn availability<T, F, Fut>(&self, scope_id: &ScopeId, load: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.get_or_load(
            &self.availability_key(scope_id),
            Duration::from_secs(self.config.availability_ttl_secs),
            load,
        )
        .await
    }

    /// Cached queue position view for one subject's token.
    ///
    /// # Errors
    ///
    /// Propagates only the loader's error; cache failures are logged and
    /// degrade to a direct load.
    pub async fn position<T, F, Fut>(
        &self,
        subject_id: &SubjectId,
        token_id: &TokenId,
        load: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.get_or_load(
            &self.position_key(subject_id, token_id),
            Duration::from_secs(self.config.position_ttl_secs),
            load,
        )
        .await
    }

    /// Drop the cached availability listing after a reservation commits.
    pub async fn invalidate_availability(&self, scope_id: &ScopeId) {
        let key = self.availability_key(scope_id);
        if let Err(err) = self.store.delete(&key).await {
            tracing::warn!(key, error = %err, "Cache invalidation failed");
        }
    }

    /// Drop the cached position view after a token changes state.
    pub async fn invalidate_position(&self, subject_id: &SubjectId, token_id: &TokenId) {
        let key = self.position_key(subject_id, token_id);
        if let Err(err) = self.store.delete(&key).await {
            tracing::warn!(key, error = %err, "Cache invalidation failed");
        }
    }

    /// Administrative flush of every cached view.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Storage`] when the backing store fails.
    pub async fn evict_all(&self) -> Result<u64> {
        let prefix = format!("{}:", self.config.key_prefix);
        let removed = self.store.delete_by_prefix(&prefix).await?;
        tracing::info!(removed, "Evicted all cached views");
        Ok(removed)
    }

    async fn get_or_load<T, F, Fut>(&self, key: &str, ttl: Duration, load: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    crate::metrics::record_cache_hit();
                    return Ok(value);
                }
                Err(err) => {
                    tracing::warn!(key, error = %err, "Discarding undecodable cache entry");
                    if let Err(err) = self.store.delete(key).await {
                        tracing::warn!(key, error = %err, "Cache eviction failed");
                    }
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(key, error = %err, "Cache read failed, loading directly");
            }
        }

        crate::metrics::record_cache_miss();
        let value = load().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(err) = self.store.set(key, &raw, ttl).await {
                    tracing::warn!(key, error = %err, "Cache write failed");
                }
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "Cache serialization failed");
            }
        }

        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryKeyValueStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (Arc<ManualClock>, ViewCache) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryKeyValueStore::new(clock.clone()));
        (clock, ViewCache::new(store, CacheConfig::default()))
    }

    #[tokio::test]
    async fn second_read_skips_the_loader() {
        let (_, cache) = cache();
        let scope = ScopeId::new();
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Vec<u32> = cache
                .availability(&scope, || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![1, 2, 3])
                })
                .await
                .unwrap();
            assert_eq!(value, vec![1, 2, 3]);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entries_reload_after_ttl() {
        let (clock, cache) = cache();
        let scope = ScopeId::new();
        let loads = AtomicUsize::new(0);

        let load = || async {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(7u32)
        };
        let _: u32 = cache.availability(&scope, load).await.unwrap();
        clock.advance(chrono::Duration::seconds(31));
        let _: u32 = cache.availability(&scope, load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidation_forces_a_reload() {
        let (_, cache) = cache();
        let scope = ScopeId::new();
        let loads = AtomicUsize::new(0);

        let load = || async {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(1u32)
        };
        let _: u32 = cache.availability(&scope, load).await.unwrap();
        cache.invalidate_availability(&scope).await;
        let _: u32 = cache.availability(&scope, load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn loader_errors_pass_through_and_nothing_is_cached() {
        let (_, cache) = cache();
        let scope = ScopeId::new();

        let failed: Result<u32> = cache
            .availability(&scope, || async {
                Err(crate::error::Error::Storage("boom".into()))
            })
            .await;
        assert!(failed.is_err());

        // The failed load left no entry behind.
        let value: u32 = cache.availability(&scope, || async { Ok(9) }).await.unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn position_entries_are_per_token() {
        let (_, cache) = cache();
        let subject = SubjectId::new();
        let (a, b) = (TokenId::new(), TokenId::new());

        let pos_a: u64 = cache.position(&subject, &a, || async { Ok(1) }).await.unwrap();
        let pos_b: u64 = cache.position(&subject, &b, || async { Ok(2) }).await.unwrap();
        assert_eq!((pos_a, pos_b), (1, 2));
    }

    #[tokio::test]
    async fn evict_all_clears_every_view() {
        let (_, cache) = cache();
        let scope = ScopeId::new();
        let loads = AtomicUsize::new(0);

        let load = || async {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(1u32)
        };
        let _: u32 = cache.availability(&scope, load).await.unwrap();
        assert_eq!(cache.evict_all().await.unwrap(), 1);
        let _: u32 = cache.availability(&scope, load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
