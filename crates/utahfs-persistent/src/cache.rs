//! LRU cache in front of reliable storage.
//!
//! The cache is write-through: a batch is committed to the layer beneath
//! before any cached entry changes, so every cached value is already durable
//! and eviction never has anything to write back.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::reliable::{ReliableStorage, WriteBatch};

/// Statistics tracking for the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries inserted.
    pub insertions: u64,
    /// Number of entries evicted to make room.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculates the cache hit rate as a ratio of hits to total accesses.
    ///
    /// Returns 0.0 if there have been no cache accesses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shared, lock-free counters for a [`Cache`].
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

impl CacheMetrics {
    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Bounded LRU cache implementing [`ReliableStorage`].
pub struct Cache {
    inner: Box<dyn ReliableStorage>,
    entries: Mutex<LruCache<String, Vec<u8>>>,
    /// Misses fill under the read side, commits hold the write side, so a
    /// fill can never install a value older than a concurrent commit.
    order: tokio::sync::RwLock<()>,
    metrics: Arc<CacheMetrics>,
}

impl Cache {
    /// Wrap `inner` with a cache of `capacity` entries.
    ///
    /// Fails with `StorageInitFailed` if `capacity` is not positive.
    pub fn new(inner: Box<dyn ReliableStorage>, capacity: i64) -> StorageResult<Self> {
        let capacity = usize::try_from(capacity)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| {
                StorageError::init_failed(
                    "cache",
                    format!("capacity must be positive, got {}", capacity),
                )
            })?;
        info!(capacity = capacity.get(), "created lru cache");
        Ok(Self {
            inner,
            entries: Mutex::new(LruCache::new(capacity)),
            order: tokio::sync::RwLock::new(()),
            metrics: Arc::new(CacheMetrics::default()),
        })
    }

    /// Returns a handle to the cache counters.
    pub fn metrics(&self) -> Arc<CacheMetrics> {
        self.metrics.clone()
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: &str, data: Vec<u8>) {
        let evicted = self.entries.lock().push(key.to_string(), data);
        self.metrics.insertions.fetch_add(1, Ordering::Relaxed);
        if let Some((old_key, _)) = evicted {
            if old_key != key {
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %old_key, "evicted cache entry");
            }
        }
    }
}

#[async_trait]
impl ReliableStorage for Cache {
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let cached = self.entries.lock().get(key).cloned();
        if let Some(data) = cached {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(data);
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);

        let _fill = self.order.read().await;
        let data = self.inner.get(key).await?;
        self.insert(key, data.clone());
        Ok(data)
    }

    async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        let _commit = self.order.write().await;
        self.inner.commit(batch.clone()).await?;
        for (key, value) in batch {
            match value {
                Some(data) => self.insert(&key, data),
                None => {
                    self.entries.lock().pop(&key);
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.entries.lock().clear();
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MemoryObjectStore;
    use crate::wal::Wal;

    async fn cache_over_wal(capacity: i64) -> (Cache, MemoryObjectStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryObjectStore::new();
        let wal = Wal::open(Box::new(backend.clone()), dir.path(), 64)
            .await
            .unwrap();
        let cache = Cache::new(Box::new(wal), capacity).unwrap();
        (cache, backend, dir)
    }

    fn put(key: &str, data: &[u8]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.insert(key.to_string(), Some(data.to_vec()));
        batch
    }

    #[tokio::test]
    async fn test_read_after_write_hits() {
        let (cache, _backend, _dir) = cache_over_wal(4).await;
        cache.commit(put("a", b"1")).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), b"1".to_vec());
        let stats = cache.metrics().snapshot();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_miss_fills_from_below() {
        let (cache, backend, _dir) = cache_over_wal(4).await;
        backend.overwrite("remote", b"x".to_vec());

        assert_eq!(cache.get("remote").await.unwrap(), b"x".to_vec());
        assert_eq!(cache.get("remote").await.unwrap(), b"x".to_vec());
        let stats = cache.metrics().snapshot();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_eviction_keeps_data_durable() {
        let (cache, backend, _dir) = cache_over_wal(2).await;
        for key in ["a", "b", "c"] {
            cache.commit(put(key, key.as_bytes())).await.unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.metrics().snapshot().evictions, 1);

        // "a" was evicted but is still served from the log or backend.
        assert_eq!(cache.get("a").await.unwrap(), b"a".to_vec());
        cache.close().await.unwrap();
        assert_eq!(backend.peek("a"), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_invalidates() {
        let (cache, _backend, _dir) = cache_over_wal(4).await;
        cache.commit(put("a", b"1")).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.insert("a".to_string(), None);
        cache.commit(batch).await.unwrap();

        assert!(cache.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_overwrite_is_not_eviction() {
        let (cache, _backend, _dir) = cache_over_wal(2).await;
        cache.commit(put("a", b"1")).await.unwrap();
        cache.commit(put("a", b"2")).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), b"2".to_vec());
        assert_eq!(cache.metrics().snapshot().evictions, 0);
    }

    #[tokio::test]
    async fn test_non_positive_capacity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for capacity in [0, -5] {
            let wal = Wal::open(Box::new(MemoryObjectStore::new()), dir.path(), 8)
                .await
                .unwrap();
            let err = Cache::new(Box::new(wal), capacity).err().unwrap();
            assert!(matches!(
                err,
                StorageError::StorageInitFailed { layer: "cache", .. }
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_read_their_own_writes() {
        let (cache, backend, _dir) = cache_over_wal(4).await;
        let cache = Arc::new(cache);

        let mut tasks = Vec::new();
        for task in 0..8u8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                let key = format!("task-{}", task);
                for round in 0..20u8 {
                    cache.commit(put(&key, &[task, round])).await.unwrap();
                    assert_eq!(cache.get(&key).await.unwrap(), vec![task, round]);
                }
            }));
        }

        // One writer bumps a shared key while readers check it never goes back.
        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for round in 0..50u8 {
                    cache.commit(put("shared", &[round])).await.unwrap();
                }
            })
        };
        let mut readers = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            readers.push(tokio::spawn(async move {
                let mut last = 0u8;
                for _ in 0..50 {
                    match cache.get("shared").await {
                        Ok(value) => {
                            assert!(value[0] >= last, "read {} after {}", value[0], last);
                            last = value[0];
                        }
                        Err(e) => assert!(e.is_not_found()),
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        for task in tasks.into_iter().chain(readers) {
            task.await.unwrap();
        }
        writer.await.unwrap();

        for task in 0..8u8 {
            let key = format!("task-{}", task);
            assert_eq!(cache.get(&key).await.unwrap(), vec![task, 19]);
        }
        assert_eq!(cache.get("shared").await.unwrap(), vec![49]);
        cache.close().await.unwrap();
        assert_eq!(backend.peek("shared"), Some(vec![49]));
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
