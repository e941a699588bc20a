//! Object storage capability: the remote backend addressed by key.
//!
//! The wire protocols of concrete providers live outside this crate; they
//! plug in by implementing [`ObjectStorage`]. [`MemoryObjectStore`] is the
//! in-process implementation used for tests and scratch mounts.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Trait for remote object store operations (B2, S3, ...).
///
/// Implementations must be safe for concurrent use by multiple in-flight
/// operations. Failures are reported as `BackendUnavailable` with the
/// provider's own transient/permanent classification, or `NotFound`.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetch the object stored under `key`.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;
    /// Store `data` under `key`, replacing any previous object.
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;
    /// Delete the object under `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;
    /// List all keys beginning with `prefix`, in sorted order.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Operation counters for the in-memory object store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStoreStats {
    /// Number of put operations.
    pub puts: u64,
    /// Number of get operations.
    pub gets: u64,
    /// Number of delete operations.
    pub deletes: u64,
    /// Number of list operations.
    pub list_calls: u64,
    /// Total bytes currently stored.
    pub total_bytes_stored: u64,
}

#[derive(Default)]
struct MemoryInner {
    objects: BTreeMap<String, Vec<u8>>,
    stats: MemoryStoreStats,
}

/// In-memory object store. Clones share the same objects.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryObjectStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get statistics about store operations.
    pub fn stats(&self) -> MemoryStoreStats {
        self.lock().stats.clone()
    }

    /// Get the number of stored objects.
    pub fn stored_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Read an object without touching the counters.
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).cloned()
    }

    /// Replace an object without touching the counters.
    ///
    /// Models out-of-band modification of the remote bucket.
    pub fn overwrite(&self, key: &str, data: Vec<u8>) {
        self.lock().objects.insert(key.to_string(), data);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock()
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStore {
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let mut inner = self.lock();
        inner.stats.gets += 1;
        debug!(key, "memory store get");
        inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        let mut inner = self.lock();
        let bytes = data.len() as u64;
        let replaced = inner
            .objects
            .insert(key.to_string(), data)
            .map(|d| d.len() as u64)
            .unwrap_or(0);
        inner.stats.puts += 1;
        inner.stats.total_bytes_stored = inner
            .stats
            .total_bytes_stored
            .saturating_sub(replaced)
            .saturating_add(bytes);
        debug!(key, bytes, "memory store put");
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut inner = self.lock();
        let removed = inner
            .objects
            .remove(key)
            .map(|d| d.len() as u64)
            .unwrap_or(0);
        inner.stats.deletes += 1;
        inner.stats.total_bytes_stored = inner.stats.total_bytes_stored.saturating_sub(removed);
        debug!(key, "memory store delete");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut inner = self.lock();
        inner.stats.list_calls += 1;
        let keys: Vec<String> = inner
            .objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        debug!(prefix, count = keys.len(), "memory store list");
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get() {
        let store = MemoryObjectStore::new();
        store.put("a", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_missing_succeeds() {
        let store = MemoryObjectStore::new();
        store.delete("nothing").await.unwrap();
        assert_eq!(store.stats().deletes, 1);
    }

    #[tokio::test]
    async fn test_list_prefix_sorted() {
        let store = MemoryObjectStore::new();
        store.put("block-2", vec![]).await.unwrap();
        store.put("block-1", vec![]).await.unwrap();
        store.put("other", vec![]).await.unwrap();

        let keys = store.list("block-").await.unwrap();
        assert_eq!(keys, vec!["block-1".to_string(), "block-2".to_string()]);
    }

    #[tokio::test]
    async fn test_clones_share_objects() {
        let store = MemoryObjectStore::new();
        let clone = store.clone();
        store.put("k", vec![9]).await.unwrap();
        assert_eq!(clone.peek("k"), Some(vec![9]));
        clone.overwrite("k", vec![8]);
        assert_eq!(store.get("k").await.unwrap(), vec![8]);
    }

    #[tokio::test]
    async fn test_stats_track_bytes() {
        let store = MemoryObjectStore::new();
        store.put("a", vec![0; 10]).await.unwrap();
        store.put("a", vec![0; 4]).await.unwrap();
        store.put("b", vec![0; 6]).await.unwrap();
        store.delete("b").await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.puts, 3);
        assert_eq!(stats.total_bytes_stored, 4);
        assert_eq!(store.stored_count(), 1);
    }
}
