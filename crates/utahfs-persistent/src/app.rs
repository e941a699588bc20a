//! Variable-size object storage over fixed-size blocks.
//!
//! Block 0 holds the allocation state. An object is a chain of blocks, each
//! holding a slice of the object and a pointer to the next block; the head
//! pointer is the object id and stays stable across rewrites. Freed blocks
//! form an on-disk trash list and are reused before fresh pointers.
//!
//! Each mutating operation works on a copy of the state and installs it only
//! once every block write has succeeded. A failed operation leaves the state
//! untouched and puts back any trash blocks it had taken.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::block::BlockStorage;
use crate::error::{StorageError, StorageResult};

/// Block pointer reserved for the allocation state.
pub const STATE_PTR: u64 = 0;

/// Upper bound on the bincode overhead of one [`BlockRecord`].
const RECORD_OVERHEAD: usize = 32;

/// Allocation state persisted at [`STATE_PTR`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    /// Application-defined root object.
    pub root: Option<u64>,
    /// Next never-used block pointer.
    pub next_ptr: u64,
    /// Head of the free-block list.
    pub trash: Option<u64>,
    /// Blocks currently holding object data.
    pub allocated: u64,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            root: None,
            next_ptr: STATE_PTR + 1,
            trash: None,
            allocated: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum BlockRecord {
    Chunk { next: Option<u64>, data: Vec<u8> },
    Free { next: Option<u64> },
}

/// Allocation changes of one operation, applied only if it succeeds.
struct Txn {
    state: AppState,
    /// Trash blocks taken so far, with the successor each one pointed at.
    reclaimed: Vec<(u64, Option<u64>)>,
}

impl Txn {
    fn begin(state: &AppState) -> Self {
        Self {
            state: state.clone(),
            reclaimed: Vec::new(),
        }
    }
}

/// Object storage over an encrypted, integrity-checked block store.
pub struct AppStorage<B: BlockStorage> {
    store: B,
    state: Mutex<AppState>,
    chunk_capacity: usize,
}

impl<B: BlockStorage> AppStorage<B> {
    /// Load the allocation state from `store`, or start empty.
    pub async fn open(store: B) -> StorageResult<Self> {
        let chunk_capacity = store.payload_capacity().saturating_sub(RECORD_OVERHEAD);
        if chunk_capacity == 0 {
            return Err(StorageError::init_failed(
                "app",
                format!("block capacity {} is too small", store.payload_capacity()),
            ));
        }
        let state = match store.read_block(STATE_PTR).await {
            Ok(bytes) => bincode::deserialize(&bytes)?,
            Err(e) if e.is_not_found() => AppState::default(),
            Err(e) => return Err(e),
        };
        info!(
            next_ptr = state.next_ptr,
            allocated = state.allocated,
            chunk_capacity,
            "opened app storage"
        );
        Ok(Self {
            store,
            state: Mutex::new(state),
            chunk_capacity,
        })
    }

    /// Bytes of object data held by one block.
    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Returns a copy of the allocation state.
    pub async fn state(&self) -> AppState {
        self.state.lock().await.clone()
    }

    /// Returns the number of blocks currently holding object data.
    pub async fn allocated_blocks(&self) -> u64 {
        self.state.lock().await.allocated
    }

    /// Returns the root object id, if one has been set.
    pub async fn root(&self) -> Option<u64> {
        self.state.lock().await.root
    }

    /// Record `root` as the root object id.
    pub async fn set_root(&self, root: Option<u64>) {
        self.state.lock().await.root = root;
    }

    /// Store `data` as a new object and return its id.
    pub async fn put(&self, data: &[u8]) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        let mut txn = Txn::begin(&state);
        let result = match self.allocate(&mut txn).await {
            Ok(head) => self
                .write_chain(&mut txn, vec![head], data)
                .await
                .map(|()| head),
            Err(e) => Err(e),
        };
        let head = self.finish(&mut state, txn, result).await?;
        debug!(id = head, len = data.len(), "stored object");
        Ok(head)
    }

    /// Read the object `id`.
    pub async fn get(&self, id: u64) -> StorageResult<Vec<u8>> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        self.walk(&state, id, |data| out.extend_from_slice(data))
            .await?;
        Ok(out)
    }

    /// Replace the contents of object `id`, keeping its id.
    pub async fn set(&self, id: u64, data: &[u8]) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let chain = self.walk(&state, id, |_| {}).await?;
        let mut txn = Txn::begin(&state);
        let result = self.write_chain(&mut txn, chain, data).await;
        self.finish(&mut state, txn, result).await?;
        debug!(id, len = data.len(), "rewrote object");
        Ok(())
    }

    /// Delete object `id` and reclaim its blocks.
    pub async fn delete(&self, id: u64) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let chain = self.walk(&state, id, |_| {}).await?;
        let mut txn = Txn::begin(&state);
        let mut result = Ok(());
        for ptr in &chain {
            result = self.release(&mut txn, *ptr).await;
            if result.is_err() {
                break;
            }
        }
        self.finish(&mut state, txn, result).await?;
        debug!(id, blocks = chain.len(), "deleted object");
        Ok(())
    }

    /// Persist the allocation state and flush every layer beneath.
    pub async fn commit(&self) -> StorageResult<()> {
        let state = self.state.lock().await;
        self.store
            .write_block(STATE_PTR, bincode::serialize(&*state)?)
            .await?;
        self.store.flush().await
    }

    /// Commit, then close every layer beneath.
    pub async fn close(&self) -> StorageResult<()> {
        self.commit().await?;
        self.store.close().await
    }

    /// Returns the block store beneath.
    pub fn store(&self) -> &B {
        &self.store
    }

    /// Install `txn` if `result` succeeded; otherwise return its trash
    /// blocks to the free list on disk and keep the old state.
    async fn finish<T>(
        &self,
        state: &mut AppState,
        txn: Txn,
        result: StorageResult<T>,
    ) -> StorageResult<T> {
        match result {
            Ok(value) => {
                *state = txn.state;
                Ok(value)
            }
            Err(e) => {
                for (ptr, next) in txn.reclaimed {
                    let free = BlockRecord::Free { next };
                    if let Err(restore) = self.write_record(ptr, &free).await {
                        warn!(ptr, error = %restore, "could not return block to trash");
                    }
                }
                debug!(error = %e, "object operation rolled back");
                Err(e)
            }
        }
    }

    async fn allocate(&self, txn: &mut Txn) -> StorageResult<u64> {
        let state = &mut txn.state;
        let ptr = match state.trash {
            Some(ptr) => {
                match self.read_record(ptr).await? {
                    BlockRecord::Free { next } => {
                        state.trash = next;
                        txn.reclaimed.push((ptr, next));
                    }
                    BlockRecord::Chunk { .. } => {
                        return Err(StorageError::Corrupted {
                            ptr,
                            reason: "trash list points at a live block".to_string(),
                        })
                    }
                }
                ptr
            }
            None => {
                let ptr = state.next_ptr;
                state.next_ptr += 1;
                ptr
            }
        };
        state.allocated += 1;
        Ok(ptr)
    }

    async fn release(&self, txn: &mut Txn, ptr: u64) -> StorageResult<()> {
        let state = &mut txn.state;
        self.write_record(ptr, &BlockRecord::Free { next: state.trash })
            .await?;
        state.trash = Some(ptr);
        state.allocated = state.allocated.saturating_sub(1);
        Ok(())
    }

    async fn read_record(&self, ptr: u64) -> StorageResult<BlockRecord> {
        let bytes = self.store.read_block(ptr).await?;
        Ok(bincode::deserialize(&bytes)?)
    }

    async fn write_record(&self, ptr: u64, record: &BlockRecord) -> StorageResult<()> {
        self.store.write_block(ptr, bincode::serialize(record)?).await
    }

    /// Follow the chain starting at `id`, feeding each slice to `visit`.
    /// Returns the pointers of the chain in order.
    async fn walk<F>(&self, state: &AppState, id: u64, mut visit: F) -> StorageResult<Vec<u64>>
    where
        F: FnMut(&[u8]) + Send,
    {
        if id == STATE_PTR || id >= state.next_ptr {
            return Err(StorageError::NotFound {
                key: format!("object {}", id),
            });
        }
        let mut chain = Vec::new();
        let mut ptr = Some(id);
        while let Some(current) = ptr {
            if chain.len() as u64 >= state.next_ptr {
                return Err(StorageError::Corrupted {
                    ptr: current,
                    reason: "object chain loops".to_string(),
                });
            }
            match self.read_record(current).await? {
                BlockRecord::Chunk { next, data } => {
                    visit(&data);
                    chain.push(current);
                    ptr = next;
                }
                BlockRecord::Free { .. } if current == id => {
                    return Err(StorageError::NotFound {
                        key: format!("object {}", id),
                    })
                }
                BlockRecord::Free { .. } => {
                    return Err(StorageError::Corrupted {
                        ptr: current,
                        reason: "object chain reaches a free block".to_string(),
                    })
                }
            }
        }
        Ok(chain)
    }

    /// Write `data` over `chain`, growing or shrinking it as needed.
    async fn write_chain(
        &self,
        txn: &mut Txn,
        mut chain: Vec<u64>,
        data: &[u8],
    ) -> StorageResult<()> {
        let needed = data.len().div_ceil(self.chunk_capacity).max(1);
        while chain.len() < needed {
            let ptr = self.allocate(txn).await?;
            chain.push(ptr);
        }
        for ptr in chain.split_off(needed) {
            self.release(txn, ptr).await?;
        }

        let mut slices = data.chunks(self.chunk_capacity);
        for (i, ptr) in chain.iter().enumerate() {
            let record = BlockRecord::Chunk {
                next: chain.get(i + 1).copied(),
                data: slices.next().unwrap_or(&[]).to_vec(),
            };
            self.write_record(*ptr, &record).await?;
        }
        Ok(())
    }
}
