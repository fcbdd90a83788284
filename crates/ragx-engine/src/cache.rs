//! Embedding cache
//!
//! Wraps any [`EmbeddingClient`] with a bounded, TTL-limited cache so that
//! re-ingesting unchanged chunks and repeating queries do not pay for the
//! model call again. Uses the moka crate for thread-safe, async-compatible
//! caching.
//!
//! Author: hephaex@gmail.com

use async_trait::async_trait;
use moka::future::Cache;
use ragx_core::{CacheConfig, RagxError, Result};
use ragx_vector::EmbeddingClient;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Cached Embedding Client
// ============================================================================

/// Embedding client decorator backed by a moka cache
///
/// Only the texts missing from the cache are forwarded to the inner client,
/// in one batch, and the output keeps input order.
pub struct CachedEmbedding {
    inner: Arc<dyn EmbeddingClient>,
    cache: Cache<u64, Arc<Vec<f32>>>,
    stats: Arc<CacheStats>,
}

impl CachedEmbedding {
    pub fn new(inner: Arc<dyn EmbeddingClient>, config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_seconds))
            .build();

        Self {
            inner,
            cache,
            stats: Arc::new(CacheStats::new("embedding")),
        }
    }

    /// Wrap `inner` when caching is enabled, otherwise return it unchanged
    pub fn wrap(inner: Arc<dyn EmbeddingClient>, config: &CacheConfig) -> Arc<dyn EmbeddingClient> {
        if config.enabled {
            Arc::new(Self::new(inner, config))
        } else {
            inner
        }
    }

    fn key(&self, text: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.inner.model_name().hash(&mut hasher);
        text.hash(&mut hasher);
        hasher.finish()
    }

    /// Clear all cached embeddings
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        self.stats.reset();
    }

    /// Get cache statistics
    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl EmbeddingClient for CachedEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut missing = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self.cache.get(&self.key(text)).await {
                Some(vector) => {
                    self.stats.record_hit();
                    vectors.push(Some(vector.as_ref().clone()));
                }
                None => {
                    self.stats.record_miss();
                    vectors.push(None);
                    missing.push(i);
                }
            }
        }

        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let computed = self.inner.embed_batch(&batch).await?;
            if computed.len() != batch.len() {
                return Err(RagxError::EmbeddingUnavailable(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    computed.len()
                )));
            }

            for (i, vector) in missing.into_iter().zip(computed) {
                self.cache
                    .insert(self.key(&texts[i]), Arc::new(vector.clone()))
                    .await;
                self.stats.record_write();
                vectors[i] = Some(vector);
            }
        }

        Ok(vectors.into_iter().flatten().collect())
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

// ============================================================================
// Cache Statistics
// ============================================================================

/// Statistics for cache performance monitoring
#[derive(Debug)]
pub struct CacheStats {
    name: String,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl CacheStats {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Calculate hit rate (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    pub fn report(&self) -> CacheStatsReport {
        CacheStatsReport {
            name: self.name.clone(),
            hits: self.hits(),
            misses: self.misses(),
            writes: self.writes(),
            hit_rate: self.hit_rate(),
        }
    }
}

/// Serializable cache statistics report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsReport {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub hit_rate: f64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ragx_vector::HashingEmbedding;
    use std::sync::atomic::AtomicUsize;

    /// Counts how many texts reach the wrapped model
    struct CountingEmbedding {
        inner: HashingEmbedding,
        texts_seen: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingClient for CountingEmbedding {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.texts_seen.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
    }

    fn counting() -> Arc<CountingEmbedding> {
        Arc::new(CountingEmbedding {
            inner: HashingEmbedding::new(16),
            texts_seen: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_only_misses_reach_the_model() {
        let inner = counting();
        let cached = CachedEmbedding::new(inner.clone(), &CacheConfig::default());

        let first = vec!["alpha".to_string(), "beta".to_string()];
        cached.embed_batch(&first).await.unwrap();
        assert_eq!(inner.texts_seen.load(Ordering::SeqCst), 2);

        let second = vec!["beta".to_string(), "gamma".to_string(), "alpha".to_string()];
        let vectors = cached.embed_batch(&second).await.unwrap();
        assert_eq!(inner.texts_seen.load(Ordering::SeqCst), 3);

        let direct = inner.inner.embed_batch(&second).await.unwrap();
        assert_eq!(vectors, direct);

        let stats = cached.stats();
        assert_eq!(stats.hits(), 2);
        assert_eq!(stats.misses(), 3);
        assert_eq!(stats.writes(), 3);
    }

    #[tokio::test]
    async fn test_clear_resets_cache() {
        let inner = counting();
        let cached = CachedEmbedding::new(inner.clone(), &CacheConfig::default());

        cached.embed("text").await.unwrap();
        cached.clear().await;
        cached.embed("text").await.unwrap();

        assert_eq!(inner.texts_seen.load(Ordering::SeqCst), 2);
        assert_eq!(cached.stats().hits(), 0);
    }

    #[test]
    fn test_wrap_respects_enabled_flag() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let wrapped = CachedEmbedding::wrap(counting(), &config);
        assert_eq!(wrapped.model_name(), "hashing-v1");
        assert_eq!(wrapped.dimension(), 16);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::new("test");
        assert_eq!(stats.hit_rate(), 0.0);
        stats.record_hit();
        stats.record_miss();
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.report().name, "test");
    }
}
