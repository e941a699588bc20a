#![warn(missing_docs)]

//! UtahFS persistent storage: the layer stack between a remote object store
//! and the filesystem.
//!
//! From the bottom up: an [`ObjectStorage`] backend, optionally wrapped in
//! [`RetryStore`]; a local write-ahead log ([`Wal`]) that turns it into
//! [`ReliableStorage`]; an optional LRU [`Cache`]; write buffering
//! ([`BufferedStore`]); fixed-size block framing ([`SimpleBlock`]); digest
//! pinning ([`Integrity`]); AES-GCM [`Encryption`]; and finally
//! variable-size objects ([`AppStorage`]).

pub mod app;
pub mod block;
pub mod buffered;
pub mod cache;
pub mod encryption;
pub mod error;
pub mod integrity;
pub mod object;
pub mod reliable;
pub mod retry;
pub mod wal;

pub use app::{AppState, AppStorage, STATE_PTR};
pub use block::{block_key, BlockStorage, SimpleBlock, DEFAULT_BLOCK_SIZE};
pub use buffered::{BufferedStore, DEFAULT_FLUSH_THRESHOLD};
pub use cache::{Cache, CacheMetrics, CacheStats};
pub use encryption::{Encryption, EncryptionKey, OVERHEAD as ENCRYPTION_OVERHEAD};
pub use error::{StorageError, StorageResult};
pub use integrity::{block_digest, reset_pin_store, Digest, Integrity};
pub use object::{MemoryObjectStore, MemoryStoreStats, ObjectStorage};
pub use reliable::{ReliableStorage, WriteBatch};
pub use retry::{RetryConfig, RetryStore};
pub use wal::{Wal, WalConfig, WalStats};
