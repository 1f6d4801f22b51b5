//! Two-layer translation cache (C4): bounded in-memory LRU fronting the
//! persistent store.
//!
//! The LRU is keyed by RequestKey without the source hash, trusting the
//! store's most recent `done` row to disambiguate. All operations are short
//! and non-blocking, so a plain mutex around the LRU is enough.

use crate::config::CacheConfig;
use crate::error::Result;
use crate::store::{RequestKey, Store};
use chrono::Utc;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{event, Level};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    video_id: String,
    lang: String,
    track: String,
    fmt: String,
}

impl From<&RequestKey> for CacheKey {
    fn from(key: &RequestKey) -> Self {
        Self {
            video_id: key.video_id.clone(),
            lang: key.lang.clone(),
            track: key.track.clone(),
            fmt: key.fmt.clone(),
        }
    }
}

/// Snapshot of cache hit/miss counters for `/admin/stats`.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct Cache {
    memory: Mutex<LruCache<CacheKey, String>>,
}

impl Cache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.lru_max_items.max(1)).unwrap();
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up the rendered bilingual text for a request key. Checks the
    /// memory layer first, then falls back to the store's most recent
    /// `done` row, promoting it into memory on a store hit.
    pub async fn get(&self, store: &Store, key: &RequestKey) -> Result<Option<String>> {
        let cache_key = CacheKey::from(key);

        if let Some(hit) = self.memory.lock().unwrap().get(&cache_key).cloned() {
            store.increment_counter("cache_hits").await?;
            return Ok(Some(hit));
        }

        let now = Utc::now().timestamp_millis();
        match store.find_latest_done(key, now).await? {
            Some(row) => {
                let bilingual = row.bilingual.unwrap_or_default();
                if bilingual.is_empty() {
                    store.increment_counter("cache_misses").await?;
                    return Ok(None);
                }
                store.increment_counter("cache_hits").await?;
                self.memory
                    .lock()
                    .unwrap()
                    .put(cache_key, bilingual.clone());
                Ok(Some(bilingual))
            }
            None => {
                store.increment_counter("cache_misses").await?;
                Ok(None)
            }
        }
    }

    /// Insert a freshly translated result into the memory layer. The store
    /// write is the caller's responsibility (the worker owns job rows).
    pub fn put(&self, key: &RequestKey, bilingual: String) {
        self.memory
            .lock()
            .unwrap()
            .put(CacheKey::from(key), bilingual);
    }

    pub fn invalidate(&self, key: &RequestKey) {
        self.memory.lock().unwrap().pop(&CacheKey::from(key));
    }

    pub async fn stats(&self, store: &Store) -> Result<CacheStats> {
        let hits = store.read_counter("cache_hits").await?;
        let misses = store.read_counter("cache_misses").await?;
        Ok(CacheStats { hits, misses })
    }

    pub fn memory_len(&self) -> usize {
        self.memory.lock().unwrap().len()
    }
}

pub fn format_cache_stats(stats: &CacheStats) -> String {
    event!(Level::DEBUG, hits = stats.hits, misses = stats.misses, "cache stats snapshot");
    format!(
        "cache: {} hits, {} misses, {:.1}% hit rate",
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(video_id: &str) -> RequestKey {
        RequestKey {
            video_id: video_id.into(),
            lang: "zh-CN".into(),
            track: "asr".into(),
            fmt: "json3".into(),
        }
    }

    #[tokio::test]
    async fn memory_hit_avoids_store_lookup() {
        let store = Store::connect_in_memory().await.unwrap();
        let cache = Cache::new(&CacheConfig::default());
        cache.put(&key("abc"), "WEBVTT\n\n".into());

        let hit = cache.get(&store, &key("abc")).await.unwrap();
        assert_eq!(hit.as_deref(), Some("WEBVTT\n\n"));
        assert_eq!(cache.stats(&store).await.unwrap().hits, 1);
    }

    #[tokio::test]
    async fn store_hit_promotes_into_memory() {
        let store = Store::connect_in_memory().await.unwrap();
        let cache = Cache::new(&CacheConfig::default());
        let rk = key("abc");

        let job = store
            .create_job(&rk, "hash1", "WEBVTT\n\n1\n00:00:00.000 --> 00:00:01.000\nhi\n\n", "vtt", 3_600_000)
            .await
            .unwrap();
        store.mark_done(&job.id, "WEBVTT\n\n").await.unwrap();

        assert_eq!(cache.memory_len(), 0);
        let hit = cache.get(&store, &rk).await.unwrap();
        assert_eq!(hit.as_deref(), Some("WEBVTT\n\n"));
        assert_eq!(cache.memory_len(), 1);
    }

    #[tokio::test]
    async fn total_miss_increments_miss_counter() {
        let store = Store::connect_in_memory().await.unwrap();
        let cache = Cache::new(&CacheConfig::default());
        let hit = cache.get(&store, &key("missing")).await.unwrap();
        assert!(hit.is_none());
        assert_eq!(cache.stats(&store).await.unwrap().misses, 1);
    }

    #[tokio::test]
    async fn invalidate_evicts_from_memory() {
        let store = Store::connect_in_memory().await.unwrap();
        let cache = Cache::new(&CacheConfig::default());
        cache.put(&key("abc"), "WEBVTT\n\n".into());
        cache.invalidate(&key("abc"));
        assert_eq!(cache.memory_len(), 0);
        let hit = cache.get(&store, &key("abc")).await.unwrap();
        assert!(hit.is_none());
    }

    #[test]
    fn hit_rate_handles_zero_total() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
    }
}
