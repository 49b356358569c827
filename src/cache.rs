use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// A memoized analysis result with its expiry metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub compressed: bool,
    pub size: usize,
}

impl CacheEntry {
    fn new(data: Vec<u8>, ttl: Duration, compressed: bool) -> Self {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));

        Self {
            size: data.len(),
            data,
            created_at: now,
            expires_at,
            compressed,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_usage: usize,
    pub entry_count: usize,
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

/// TTL-bounded memoization store for analysis results.
///
/// Values are stored serialized so a single cache instance can hold results of
/// differently typed analyses; `get`/`set` stay generic per call site. There
/// is no LRU or size bound: growth is limited only by the caller's key space
/// and the expiry sweep that runs opportunistically on writes.
pub struct AnalysisCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    stats: Arc<Mutex<CacheStats>>,
    enable_compression: bool,
    compression_threshold: usize,
}

impl AnalysisCache {
    pub fn new(enable_compression: bool) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(Mutex::new(CacheStats::default())),
            enable_compression,
            compression_threshold: 1024,
        }
    }

    /// Get a live entry. Absence and expiry are both normal misses; an expired
    /// entry is evicted as a side effect of the read.
    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let entry = {
            let mut entries = self.entries.lock().await;
            let expired = entries.get(key).map(|e| e.is_expired());
            match expired {
                Some(true) => {
                    entries.remove(key);
                    let mut stats = self.stats.lock().await;
                    stats.evictions += 1;
                    None
                }
                Some(false) => entries.get(key).cloned(),
                None => None,
            }
        };

        let result = match entry {
            Some(entry) => match self.decode::<T>(&entry) {
                Ok(value) => Some(value),
                Err(e) => {
                    // Corrupt payloads are treated as misses and evicted.
                    debug!(key, error = %e, "evicting undecodable cache entry");
                    self.entries.lock().await.remove(key);
                    None
                }
            },
            None => None,
        };

        let mut stats = self.stats.lock().await;
        if result.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }

        result
    }

    /// Overwrite `key` with a fresh entry expiring after `ttl`. Expired
    /// entries elsewhere in the map are swept while the lock is held.
    pub async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> anyhow::Result<()>
    where
        T: serde::Serialize,
    {
        let serialized = bincode::serialize(value)
            .map_err(|e| anyhow::anyhow!("cache serialization error: {}", e))?;
        self.set_serialized(key, serialized, ttl).await
    }

    /// Store a payload that is already bincode-encoded. The scheduler's queued
    /// path lands here, since queued results travel serialized.
    pub(crate) async fn set_serialized(
        &self,
        key: &str,
        serialized: Vec<u8>,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        let compress = self.enable_compression && serialized.len() >= self.compression_threshold;
        let payload = if compress {
            compress_data(&serialized)?
        } else {
            serialized
        };

        let entry = CacheEntry::new(payload, ttl, compress);

        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), entry);

        // Opportunistic sweep keeps unbounded growth in check between reads.
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        if !expired.is_empty() {
            let mut stats = self.stats.lock().await;
            stats.evictions += expired.len() as u64;
            for k in expired {
                entries.remove(&k);
            }
        }

        Ok(())
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let entries = self.entries.lock().await;
        entries.get(key).map(|e| !e.is_expired()).unwrap_or(false)
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();

        let mut stats = self.stats.lock().await;
        *stats = CacheStats::default();
    }

    /// Remove all expired entries, returning how many were dropped.
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();

        let removed = expired.len();
        for k in expired {
            entries.remove(&k);
        }

        if removed > 0 {
            let mut stats = self.stats.lock().await;
            stats.evictions += removed as u64;
        }

        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let mut stats = self.stats.lock().await.clone();

        let entries = self.entries.lock().await;
        stats.entry_count = entries.len();
        stats.memory_usage = entries.values().map(|e| e.size).sum();

        stats
    }

    fn decode<T>(&self, entry: &CacheEntry) -> anyhow::Result<T>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let bytes = if entry.compressed {
            decompress_data(&entry.data)?
        } else {
            entry.data.clone()
        };

        bincode::deserialize(&bytes)
            .map_err(|e| anyhow::anyhow!("cache deserialization error: {}", e))
    }
}

fn compress_data(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress_data(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration as TokioDuration};

    #[tokio::test]
    async fn test_cache_basic_operations() {
        let cache = AnalysisCache::new(false);

        cache
            .set("key1", &"value1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        let result: Option<String> = cache.get("key1").await;
        assert_eq!(result, Some("value1".to_string()));

        let result: Option<String> = cache.get("nonexistent").await;
        assert_eq!(result, None);

        assert!(cache.contains_key("key1").await);
        assert!(!cache.contains_key("nonexistent").await);
    }

    #[tokio::test]
    async fn test_cache_expiration() {
        let cache = AnalysisCache::new(false);

        cache
            .set("key1", &"value1".to_string(), Duration::from_millis(100))
            .await
            .unwrap();

        let result: Option<String> = cache.get("key1").await;
        assert_eq!(result, Some("value1".to_string()));

        sleep(TokioDuration::from_millis(150)).await;

        let result: Option<String> = cache.get("key1").await;
        assert_eq!(result, None);
        assert!(!cache.contains_key("key1").await);
    }

    #[tokio::test]
    async fn test_cache_overwrite() {
        let cache = AnalysisCache::new(false);

        cache
            .set("key1", &1u64, Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set("key1", &2u64, Duration::from_secs(60))
            .await
            .unwrap();

        let result: Option<u64> = cache.get("key1").await;
        assert_eq!(result, Some(2));

        let stats = cache.stats().await;
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_cache_clear_and_stats() {
        let cache = AnalysisCache::new(false);

        cache
            .set("key1", &"value1".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        let _: Option<String> = cache.get("key1").await;
        let _: Option<String> = cache.get("nonexistent").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);

        cache.clear().await;
        let stats = cache.stats().await;
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_cache_compression_round_trip() {
        let cache = AnalysisCache::new(true);

        let large = "x".repeat(4096);
        cache
            .set("large", &large, Duration::from_secs(60))
            .await
            .unwrap();

        let result: Option<String> = cache.get("large").await;
        assert_eq!(result, Some(large.clone()));

        // The stored payload should be smaller than the raw string.
        let stats = cache.stats().await;
        assert!(stats.memory_usage < large.len());
    }

    #[tokio::test]
    async fn test_cache_sweep_on_write() {
        let cache = AnalysisCache::new(false);

        cache
            .set("short", &"a".to_string(), Duration::from_millis(30))
            .await
            .unwrap();
        sleep(TokioDuration::from_millis(60)).await;

        // Writing another key sweeps the expired one without touching it.
        cache
            .set("other", &"b".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.entry_count, 1);
        assert!(stats.evictions >= 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let cache = AnalysisCache::new(false);

        cache
            .set("a", &1u32, Duration::from_millis(20))
            .await
            .unwrap();
        cache.set("b", &2u32, Duration::from_secs(60)).await.unwrap();

        sleep(TokioDuration::from_millis(50)).await;

        let removed = cache.cleanup_expired().await;
        assert_eq!(removed, 1);
        assert!(cache.contains_key("b").await);
    }
}
