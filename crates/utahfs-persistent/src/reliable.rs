//! Reliable storage capability: durable, batch-committed bytes by key.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::error::StorageResult;

/// A set of writes applied together. `None` deletes the key.
pub type WriteBatch = BTreeMap<String, Option<Vec<u8>>>;

/// Storage whose committed writes survive a crash of the local process.
///
/// A write to key K that has been committed is visible to every subsequent
/// read of K, from any caller.
#[async_trait]
pub trait ReliableStorage: Send + Sync {
    /// Fetch the current value of `key`, or `NotFound`.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Fetch several keys. Missing keys are omitted from the result.
    async fn get_many(&self, keys: &[String]) -> StorageResult<HashMap<String, Vec<u8>>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            match self.get(key).await {
                Ok(data) => {
                    out.insert(key.clone(), data);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Durably apply every write in `batch`.
    async fn commit(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Flush outstanding work and release background resources.
    async fn close(&self) -> StorageResult<()>;
}
