//! Write buffering between the block framer and reliable storage.
//!
//! Writes accumulate in a pending batch and reach the layer beneath as a
//! single `commit` on [`BufferedStore::flush`], or automatically once the
//! batch reaches its threshold. A layer above that must act before every
//! commit turns the automatic flush off and polls [`BufferedStore::flush_due`]
//! instead. Reads always observe the caller's own writes, whether still
//! pending, mid-flush, or committed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::reliable::{ReliableStorage, WriteBatch};

/// Default number of buffered writes that triggers an automatic flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 256;

#[derive(Default)]
struct Buffers {
    pending: WriteBatch,
    /// Batch currently being committed beneath.
    in_flight: Option<Arc<WriteBatch>>,
}

impl Buffers {
    fn lookup(&self, key: &str) -> Option<Option<Vec<u8>>> {
        if let Some(value) = self.pending.get(key) {
            return Some(value.clone());
        }
        self.in_flight
            .as_ref()
            .and_then(|batch| batch.get(key).cloned())
    }
}

/// Buffered storage over a [`ReliableStorage`].
pub struct BufferedStore {
    inner: Box<dyn ReliableStorage>,
    buffers: Mutex<Buffers>,
    flush_lock: tokio::sync::Mutex<()>,
    flush_threshold: usize,
    auto_flush: AtomicBool,
}

impl BufferedStore {
    /// Create a buffered store with the default flush threshold.
    pub fn new(inner: Box<dyn ReliableStorage>) -> Self {
        Self::with_threshold(inner, DEFAULT_FLUSH_THRESHOLD)
    }

    /// Create a buffered store that auto-flushes after `flush_threshold` writes.
    pub fn with_threshold(inner: Box<dyn ReliableStorage>, flush_threshold: usize) -> Self {
        Self {
            inner,
            buffers: Mutex::new(Buffers::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_threshold: flush_threshold.max(1),
            auto_flush: AtomicBool::new(true),
        }
    }

    /// Enable or disable flushing from inside `set`/`delete` at the threshold.
    pub fn set_auto_flush(&self, enabled: bool) {
        self.auto_flush.store(enabled, Ordering::SeqCst);
    }

    /// Returns true once the pending batch has reached the flush threshold.
    pub fn flush_due(&self) -> bool {
        self.pending_len() >= self.flush_threshold
    }

    /// Returns the number of writes waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.buffers.lock().pending.len()
    }

    /// Read `key`, preferring buffered writes over the layer beneath.
    pub async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let buffered = self.buffers.lock().lookup(key);
        match buffered {
            Some(Some(data)) => Ok(data),
            Some(None) => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            None => self.inner.get(key).await,
        }
    }

    /// Buffer a write of `data` to `key`.
    pub async fn set(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.stage(key, Some(data)).await
    }

    /// Buffer a deletion of `key`.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        self.stage(key, None).await
    }

    async fn stage(&self, key: &str, value: Option<Vec<u8>>) -> StorageResult<()> {
        let full = {
            let mut buffers = self.buffers.lock();
            buffers.pending.insert(key.to_string(), value);
            buffers.pending.len() >= self.flush_threshold
        };
        if full && self.auto_flush.load(Ordering::SeqCst) {
            self.flush().await?;
        }
        Ok(())
    }

    /// Commit every buffered write to the layer beneath as one batch.
    pub async fn flush(&self) -> StorageResult<()> {
        let _guard = self.flush_lock.lock().await;
        let batch = {
            let mut buffers = self.buffers.lock();
            if buffers.pending.is_empty() {
                return Ok(());
            }
            let batch = Arc::new(std::mem::take(&mut buffers.pending));
            buffers.in_flight = Some(batch.clone());
            batch
        };
        debug!(writes = batch.len(), "flushing buffered writes");

        let result = self.inner.commit(batch.as_ref().clone()).await;

        let mut buffers = self.buffers.lock();
        buffers.in_flight = None;
        if result.is_err() {
            // Put the failed batch back underneath anything written since.
            let mut restored = batch.as_ref().clone();
            restored.append(&mut buffers.pending);
            buffers.pending = restored;
        }
        result
    }

    /// Flush, then close the layer beneath.
    pub async fn close(&self) -> StorageResult<()> {
        self.flush().await?;
        self.inner.close().await
    }
}
