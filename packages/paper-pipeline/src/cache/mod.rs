//! Read-through caches with per-category TTLs.
//!
//! Entries are independent: concurrent writes to distinct keys never
//! contend, and concurrent writes to the same key resolve last-write-wins.
//! Expired entries are dropped lazily on read; an optional size bound
//! evicts the least recently used entry on insert.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::types::config::CacheConfig;
use crate::types::document::DocumentRecord;
use crate::types::extraction::ExtractionResult;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_access: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.inserted_at) >= ttl
    }
}

/// A keyed cache with a fixed time-to-live.
pub struct TtlCache<V> {
    name: &'static str,
    ttl: Duration,
    max_entries: Option<usize>,
    entries: DashMap<String, CacheEntry<V>>,
    tick: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    /// A zero TTL disables the cache: inserts are dropped.
    pub fn new(name: &'static str, ttl: Duration, max_entries: Option<usize>) -> Self {
        Self {
            name,
            ttl,
            max_entries: max_entries.filter(|m| *m > 0),
            entries: DashMap::new(),
            tick: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Live value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) if entry.is_expired(now, self.ttl) => true,
            Some(entry) => {
                entry.last_access.store(self.next_tick(), Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        };
        if expired {
            self.entries
                .remove_if(key, |_, entry| entry.is_expired(now, self.ttl));
            debug!(cache = self.name, key, "Cache entry expired");
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        if !self.is_enabled() {
            return;
        }
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            last_access: AtomicU64::new(self.next_tick()),
        };
        self.entries.insert(key.into(), entry);
        self.evict_over_capacity();
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Entry count, including expired entries not yet read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Never required for correctness.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now, self.ttl));
        before.saturating_sub(self.entries.len())
    }

    /// Return the cached value, or run `fetch` and cache its success.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key) {
            debug!(cache = self.name, key, "Cache hit");
            return Ok(hit);
        }
        let value = fetch().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_over_capacity(&self) {
        let Some(max) = self.max_entries else {
            return;
        };
        while self.entries.len() > max {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_access.load(Ordering::Relaxed))
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    debug!(cache = self.name, key = %key, "Evicted least recently used entry");
                }
                None => break,
            }
        }
    }
}

/// The pipeline's cache categories.
pub struct CacheLayer {
    /// Discovery query results, keyed by query string
    pub queries: TtlCache<Vec<DocumentRecord>>,
    /// Fetched binaries, keyed by the record's cache key
    pub content: TtlCache<Bytes>,
    /// Extraction output, keyed by record key and requirement hash
    pub extractions: TtlCache<ExtractionResult>,
}

impl CacheLayer {
    pub fn new(config: &CacheConfig) -> Self {
        let max = config.max_entries_per_category;
        Self {
            queries: TtlCache::new("queries", Duration::from_millis(config.query_ttl_ms), max),
            content: TtlCache::new("content", Duration::from_millis(config.content_ttl_ms), max),
            extractions: TtlCache::new(
                "extractions",
                Duration::from_millis(config.extraction_ttl_ms),
                max,
            ),
        }
    }

    /// All categories disabled.
    pub fn disabled() -> Self {
        Self::new(&CacheConfig {
            query_ttl_ms: 0,
            content_ttl_ms: 0,
            extraction_ttl_ms: 0,
            max_entries_per_category: None,
        })
    }

    /// Key for an extraction of `record_key` against a requirement set.
    pub fn extraction_key(record_key: &str, requirement_hash: &str, prompt_hash: &str) -> String {
        let prompt = prompt_hash.get(..12).unwrap_or(prompt_hash);
        format!("{record_key}#{requirement_hash}#{prompt}")
    }

    pub fn purge_expired(&self) -> usize {
        self.queries.purge_expired() + self.content.purge_expired() + self.extractions.purge_expired()
    }
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = TtlCache::new("t", Duration::from_secs(10), None);
        cache.insert("k", 1u32);
        assert_eq!(cache.get("k"), Some(1));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = TtlCache::new("t", Duration::from_secs(10), None);
        cache.insert("k", "a".to_string());
        cache.insert("k", "b".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("b"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = TtlCache::new("t", Duration::from_secs(10), Some(2));
        cache.insert("a", 1u32);
        cache.insert("b", 2);
        // Touch "a" so "b" is the least recently used.
        cache.get("a");
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[tokio::test]
    async fn test_zero_ttl_disables() {
        let cache = TtlCache::new("t", Duration::ZERO, None);
        cache.insert("k", 1u32);
        assert!(cache.is_empty());
        assert!(!cache.is_enabled());
    }

    #[tokio::test]
    async fn test_get_or_fetch_only_fetches_on_miss() {
        let cache = TtlCache::new("t", Duration::from_secs(10), None);
        let mut fetches = 0;

        for _ in 0..3 {
            let value: Result<u32, ()> = cache
                .get_or_fetch("k", || {
                    fetches += 1;
                    async { Ok(7) }
                })
                .await;
            assert_eq!(value, Ok(7));
        }
        assert_eq!(fetches, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let cache: TtlCache<u32> = TtlCache::new("t", Duration::from_secs(10), None);
        let result: Result<u32, &str> = cache.get_or_fetch("k", || async { Err("boom") }).await;
        assert!(result.is_err());
        assert!(cache.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let layer = CacheLayer::new(&CacheConfig {
            query_ttl_ms: 1_000,
            content_ttl_ms: 5_000,
            extraction_ttl_ms: 5_000,
            max_entries_per_category: None,
        });
        layer.queries.insert("q", vec![]);
        layer.content.insert("c", Bytes::from_static(b"pdf"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(layer.purge_expired(), 1);
        assert!(layer.content.get("c").is_some());
    }

    #[test]
    fn test_extraction_key_includes_hashes() {
        let key = CacheLayer::extraction_key("doi:10.1/a", "abc", "0123456789abcdef");
        assert_eq!(key, "doi:10.1/a#abc#0123456789ab");
    }
}
