//! Fixed-size, pointer-addressed blocks.
//!
//! [`BlockStorage`] is the capability every layer from the framer upward
//! implements. [`SimpleBlock`] is the framer: it stores each block as exactly
//! `block_size` bytes, `[u32 LE payload length][payload][zero padding]`, under
//! a key derived from the block pointer.

use async_trait::async_trait;
use tracing::debug;

use crate::buffered::BufferedStore;
use crate::error::{StorageError, StorageResult};

/// Default physical block size (64 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

const LEN_PREFIX: usize = 4;
const KEY_PREFIX: &str = "block-";

/// Storage addressed by block pointer. Every write replaces a whole block.
#[async_trait]
pub trait BlockStorage: Send + Sync {
    /// Read the payload of block `ptr`, or `NotFound`.
    async fn read_block(&self, ptr: u64) -> StorageResult<Vec<u8>>;
    /// Replace block `ptr` with `payload`.
    async fn write_block(&self, ptr: u64, payload: Vec<u8>) -> StorageResult<()>;
    /// Remove block `ptr`.
    async fn delete_block(&self, ptr: u64) -> StorageResult<()>;
    /// Largest payload a single block accepts at this layer.
    fn payload_capacity(&self) -> usize;
    /// Make every completed write durable in the layers beneath.
    async fn flush(&self) -> StorageResult<()>;
    /// Flush and release the layers beneath.
    async fn close(&self) -> StorageResult<()>;

    /// Stop the layers beneath from committing writes on their own. The
    /// caller then flushes whenever [`BlockStorage::flush_due`] says so.
    fn hold_auto_flush(&self) {}

    /// True once enough writes are buffered beneath that a flush is due.
    fn flush_due(&self) -> bool {
        false
    }
}

/// Returns the storage key for block `ptr`.
pub fn block_key(ptr: u64) -> String {
    format!("{}{:016x}", KEY_PREFIX, ptr)
}

/// Block framer over buffered storage.
pub struct SimpleBlock {
    store: BufferedStore,
    block_size: usize,
}

impl SimpleBlock {
    /// Create a framer with [`DEFAULT_BLOCK_SIZE`] blocks.
    pub fn new(store: BufferedStore) -> Self {
        Self {
            store,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Create a framer with `block_size`-byte blocks.
    pub fn with_block_size(store: BufferedStore, block_size: usize) -> StorageResult<Self> {
        if block_size <= LEN_PREFIX {
            return Err(StorageError::init_failed(
                "block",
                format!("block size {} leaves no room for payload", block_size),
            ));
        }
        Ok(Self { store, block_size })
    }

    /// Returns the physical size of every stored block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut framed = Vec::with_capacity(self.block_size);
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(payload);
        framed.resize(self.block_size, 0);
        framed
    }

    fn unframe(&self, ptr: u64, mut framed: Vec<u8>) -> StorageResult<Vec<u8>> {
        if framed.len() != self.block_size {
            return Err(StorageError::Corrupted {
                ptr,
                reason: format!(
                    "block is {} bytes, expected {}",
                    framed.len(),
                    self.block_size
                ),
            });
        }
        let mut len = [0u8; LEN_PREFIX];
        len.copy_from_slice(&framed[..LEN_PREFIX]);
        let len = u32::from_le_bytes(len) as usize;
        if len > self.payload_capacity() {
            return Err(StorageError::Corrupted {
                ptr,
                reason: format!("payload length {} exceeds capacity", len),
            });
        }
        let end = LEN_PREFIX + len;
        if framed[end..].iter().any(|&b| b != 0) {
            return Err(StorageError::Corrupted {
                ptr,
                reason: "non-zero padding".to_string(),
            });
        }
        framed.truncate(end);
        framed.drain(..LEN_PREFIX);
        Ok(framed)
    }
}

#[async_trait]
impl BlockStorage for SimpleBlock {
    async fn read_block(&self, ptr: u64) -> StorageResult<Vec<u8>> {
        let framed = self.store.get(&block_key(ptr)).await?;
        self.unframe(ptr, framed)
    }

    async fn write_block(&self, ptr: u64, payload: Vec<u8>) -> StorageResult<()> {
        if payload.len() > self.payload_capacity() {
            return Err(StorageError::PayloadTooLarge {
                len: payload.len(),
                capacity: self.payload_capacity(),
            });
        }
        debug!(ptr, len = payload.len(), "writing block");
        self.store.set(&block_key(ptr), self.frame(&payload)).await
    }

    async fn delete_block(&self, ptr: u64) -> StorageResult<()> {
        self.store.delete(&block_key(ptr)).await
    }

    fn payload_capacity(&self) -> usize {
        self.block_size - LEN_PREFIX
    }

    async fn flush(&self) -> StorageResult<()> {
        self.store.flush().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.store.close().await
    }

    fn hold_auto_flush(&self) {
        self.store.set_auto_flush(false);
    }

    fn flush_due(&self) -> bool {
        self.store.flush_due()
    }
}
