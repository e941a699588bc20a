//! Skip-list files over application storage.
//!
//! A file is a sequence of nodes. Node `i` holds the bytes
//! `[i * data_size, (i + 1) * data_size)` and up to `num_ptrs` forward
//! pointers, pointer `j` leading to node `i + 2^j`. Node 0 is the head: its
//! object id is the file id and it records the file length. Data past the end
//! of a node's stored bytes but inside the file reads as zeros.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use utahfs_persistent::{AppStorage, BlockStorage, StorageError};

use crate::error::{FsError, FsResult};

/// Largest supported pointer fan-out.
pub const MAX_PTRS: usize = 63;

const NIL: u64 = u64::MAX;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SkipNode {
    /// File length; only meaningful in the head node.
    file_len: u64,
    ptrs: Vec<u64>,
    data: Vec<u8>,
}

impl SkipNode {
    fn empty(num_ptrs: usize) -> Self {
        Self {
            file_len: 0,
            ptrs: vec![NIL; num_ptrs],
            data: Vec::new(),
        }
    }
}

fn encode(node: &SkipNode) -> FsResult<Vec<u8>> {
    bincode::serialize(node).map_err(|e| FsError::Storage(e.into()))
}

fn decode(file: u64, bytes: &[u8]) -> FsResult<SkipNode> {
    bincode::deserialize(bytes).map_err(|e| FsError::Corrupted {
        id: file,
        reason: format!("undecodable node: {}", e),
    })
}

/// File-oriented storage handle.
pub struct BlockFilesystem<B: BlockStorage> {
    app: AppStorage<B>,
    num_ptrs: usize,
    data_size: u64,
    lock: RwLock<()>,
}

impl<B: BlockStorage> BlockFilesystem<B> {
    /// Build a filesystem over `app` with the given skip-list shape.
    pub fn new(app: AppStorage<B>, num_ptrs: i64, data_size: i64) -> FsResult<Self> {
        if num_ptrs <= 0 || data_size <= 0 {
            return Err(StorageError::init_failed(
                "filesystem",
                format!(
                    "num-ptrs ({}) and data-size ({}) must be positive",
                    num_ptrs, data_size
                ),
            )
            .into());
        }
        if num_ptrs as usize > MAX_PTRS {
            return Err(StorageError::init_failed(
                "filesystem",
                format!("num-ptrs ({}) exceeds {}", num_ptrs, MAX_PTRS),
            )
            .into());
        }
        info!(num_ptrs, data_size, "created block filesystem");
        Ok(Self {
            app,
            num_ptrs: num_ptrs as usize,
            data_size: data_size as u64,
            lock: RwLock::new(()),
        })
    }

    pub fn num_ptrs(&self) -> usize {
        self.num_ptrs
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Returns the application storage beneath.
    pub fn app(&self) -> &AppStorage<B> {
        &self.app
    }

    /// Create an empty file and return its id.
    pub async fn create_file(&self) -> FsResult<u64> {
        let _guard = self.lock.write().await;
        let id = self.app.put(&encode(&SkipNode::empty(self.num_ptrs))?).await?;
        self.app.commit().await?;
        debug!(id, "created file");
        Ok(id)
    }

    /// Returns the length of file `id` in bytes.
    pub async fn file_len(&self, id: u64) -> FsResult<u64> {
        let _guard = self.lock.read().await;
        let nodes = NodeCache::open(self, id).await?;
        Ok(nodes.file_len())
    }

    /// Read up to `len` bytes of file `id` starting at `offset`. Reads past
    /// the end of the file come back short.
    pub async fn read_at(&self, id: u64, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let _guard = self.lock.read().await;
        let mut nodes = NodeCache::open(self, id).await?;
        let file_len = nodes.file_len();
        if offset >= file_len || len == 0 {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(len as u64).min(file_len);
        let mut out = Vec::with_capacity((end - offset) as usize);

        for index in offset / self.data_size..=(end - 1) / self.data_size {
            let node_start = index * self.data_size;
            let from = (offset.max(node_start) - node_start) as usize;
            let to = (end.min(node_start + self.data_size) - node_start) as usize;
            let data = &nodes.node(index).await?.data;
            let stored = &data[from.min(data.len())..to.min(data.len())];
            out.extend_from_slice(stored);
            // Bytes past what the node stores are a hole.
            out.resize(out.len() + (to - from - stored.len()), 0);
        }
        Ok(out)
    }

    /// Write `data` into file `id` at `offset`, extending the file if needed.
    /// A gap between the old end of file and `offset` reads as zeros.
    pub async fn write_at(&self, id: u64, offset: u64, data: &[u8]) -> FsResult<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| FsError::InvalidArgument {
                msg: format!("write of {} bytes at {} overflows", data.len(), offset),
            })?;
        let _guard = self.lock.write().await;
        let mut nodes = NodeCache::open(self, id).await?;
        if data.is_empty() {
            return Ok(());
        }
        if end > nodes.file_len() {
            nodes.grow(end).await?;
        }

        for index in offset / self.data_size..=(end - 1) / self.data_size {
            let node_start = index * self.data_size;
            let from = (offset.max(node_start) - node_start) as usize;
            let to = (end.min(node_start + self.data_size) - node_start) as usize;
            let src = (node_start + from as u64 - offset) as usize;
            let node = nodes.node_mut(index).await?;
            if node.data.len() < to {
                node.data.resize(to, 0);
            }
            node.data[from..to].copy_from_slice(&data[src..src + (to - from)]);
        }
        nodes.store().await?;
        self.app.commit().await?;
        debug!(id, offset, len = data.len(), "wrote file");
        Ok(())
    }

    /// Set the length of file `id`, discarding or zero-extending data.
    pub async fn truncate(&self, id: u64, len: u64) -> FsResult<()> {
        let _guard = self.lock.write().await;
        let mut nodes = NodeCache::open(self, id).await?;
        let old_len = nodes.file_len();
        if len > old_len {
            nodes.grow(len).await?;
        } else if len < old_len {
            nodes.shrink(len).await?;
        }
        nodes.store().await?;
        self.app.commit().await?;
        debug!(id, old_len, len, "truncated file");
        Ok(())
    }

    /// Delete file `id` and every node it owns.
    pub async fn remove_file(&self, id: u64) -> FsResult<()> {
        let _guard = self.lock.write().await;
        let mut nodes = NodeCache::open(self, id).await?;
        let count = node_count(nodes.file_len(), self.data_size);
        let mut ids = Vec::with_capacity(count as usize);
        for index in 0..count {
            nodes.load(index).await?;
            ids.push(nodes.id_of(index));
        }
        for node_id in ids {
            self.app.delete(node_id).await?;
        }
        self.app.commit().await?;
        debug!(id, nodes = count, "removed file");
        Ok(())
    }

    /// Returns the root object id recorded by the application.
    pub async fn root(&self) -> Option<u64> {
        self.app.root().await
    }

    /// Record `root` and commit.
    pub async fn set_root(&self, root: Option<u64>) -> FsResult<()> {
        let _guard = self.lock.write().await;
        self.app.set_root(root).await;
        self.app.commit().await?;
        Ok(())
    }

    /// Make every completed operation durable.
    pub async fn commit(&self) -> FsResult<()> {
        let _guard = self.lock.write().await;
        Ok(self.app.commit().await?)
    }

    /// Commit and close every layer beneath.
    pub async fn close(&self) -> FsResult<()> {
        let _guard = self.lock.write().await;
        info!("closing block filesystem");
        Ok(self.app.close().await?)
    }
}

/// Number of nodes a file of `len` bytes occupies. The head always exists.
fn node_count(len: u64, data_size: u64) -> u64 {
    len.div_ceil(data_size).max(1)
}

/// Nodes of one file loaded during a single operation, with the ones that
/// need writing back.
struct NodeCache<'a, B: BlockStorage> {
    fs: &'a BlockFilesystem<B>,
    file: u64,
    nodes: BTreeMap<u64, (u64, SkipNode)>,
    dirty: BTreeSet<u64>,
}

impl<'a, B: BlockStorage> NodeCache<'a, B> {
    async fn open(fs: &'a BlockFilesystem<B>, file: u64) -> FsResult<Self> {
        let head = match fs.app.get(file).await {
            Ok(bytes) => decode(file, &bytes)?,
            Err(e) if e.is_not_found() => return Err(FsError::NotFound { id: file }),
            Err(e) => return Err(e.into()),
        };
        if head.ptrs.len() != fs.num_ptrs {
            return Err(FsError::Corrupted {
                id: file,
                reason: format!(
                    "head has {} pointers, filesystem uses {}",
                    head.ptrs.len(),
                    fs.num_ptrs
                ),
            });
        }
        let mut nodes = BTreeMap::new();
        nodes.insert(0, (file, head));
        Ok(Self {
            fs,
            file,
            nodes,
            dirty: BTreeSet::new(),
        })
    }

    fn file_len(&self) -> u64 {
        self.nodes.get(&0).map(|(_, head)| head.file_len).unwrap_or(0)
    }

    fn id_of(&self, index: u64) -> u64 {
        self.nodes.get(&index).map(|(id, _)| *id).unwrap_or(NIL)
    }

    fn set_file_len(&mut self, len: u64) {
        if let Some((_, head)) = self.nodes.get_mut(&0) {
            head.file_len = len;
        }
        self.dirty.insert(0);
    }

    /// Make sure node `index` is loaded, following the widest pointers from
    /// the nearest loaded node before it.
    async fn load(&mut self, index: u64) -> FsResult<()> {
        let (mut at, _) = self
            .nodes
            .range(..=index)
            .next_back()
            .map(|(k, v)| (*k, v.0))
            .unwrap_or((0, self.file));
        while at != index {
            let ptrs = &self.nodes[&at].1.ptrs;
            let hop = (0..ptrs.len())
                .rev()
                .find(|&j| (1u64 << j) <= index - at && ptrs[j] != NIL)
                .map(|j| (at + (1u64 << j), ptrs[j]));
            let (next, next_id) = hop.ok_or_else(|| FsError::Corrupted {
                id: self.file,
                reason: format!("no pointer from node {} toward node {}", at, index),
            })?;
            if !self.nodes.contains_key(&next) {
                let bytes = self.fs.app.get(next_id).await?;
                let node = decode(self.file, &bytes)?;
                self.nodes.insert(next, (next_id, node));
            }
            at = next;
        }
        Ok(())
    }

    async fn node(&mut self, index: u64) -> FsResult<&SkipNode> {
        self.load(index).await?;
        Ok(&self.nodes[&index].1)
    }

    async fn node_mut(&mut self, index: u64) -> FsResult<&mut SkipNode> {
        self.load(index).await?;
        self.dirty.insert(index);
        match self.nodes.get_mut(&index) {
            Some((_, node)) => Ok(node),
            None => Err(FsError::Corrupted {
                id: self.file,
                reason: format!("node {} vanished", index),
            }),
        }
    }

    /// Extend the file to `len` bytes, appending zero-filled nodes.
    async fn grow(&mut self, len: u64) -> FsResult<()> {
        let data_size = self.fs.data_size;
        let have = node_count(self.file_len(), data_size);
        let want = node_count(len, data_size);
        for index in have..want {
            let node = SkipNode::empty(self.fs.num_ptrs);
            let id = self.fs.app.put(&encode(&node)?).await?;
            self.nodes.insert(index, (id, node));
            for j in 0..self.fs.num_ptrs {
                let step = 1u64 << j;
                if step > index {
                    break;
                }
                self.node_mut(index - step).await?.ptrs[j] = id;
            }
        }
        self.set_file_len(len);
        Ok(())
    }

    /// Cut the file down to `len` bytes, freeing the nodes past the end.
    async fn shrink(&mut self, len: u64) -> FsResult<()> {
        let data_size = self.fs.data_size;
        let have = node_count(self.file_len(), data_size);
        let keep = node_count(len, data_size);

        let mut doomed = Vec::new();
        for index in keep..have {
            self.load(index).await?;
            doomed.push(self.id_of(index));
        }
        for j in 0..self.fs.num_ptrs {
            let step = 1u64 << j;
            let first = keep.saturating_sub(step);
            let last = keep.min(have.saturating_sub(step));
            for index in first..last {
                self.node_mut(index).await?.ptrs[j] = NIL;
            }
        }
        let tail_len = (len - (keep - 1) * data_size) as usize;
        let tail = self.node_mut(keep - 1).await?;
        tail.data.truncate(tail_len);

        for index in keep..have {
            self.nodes.remove(&index);
            self.dirty.remove(&index);
        }
        for id in doomed {
            self.fs.app.delete(id).await?;
        }
        self.set_file_len(len);
        Ok(())
    }

    /// Write every modified node back to application storage.
    async fn store(&mut self) -> FsResult<()> {
        for index in std::mem::take(&mut self.dirty) {
            if let Some((id, node)) = self.nodes.get(&index) {
                self.fs.app.set(*id, &encode(node)?).await?;
            }
        }
        Ok(())
    }
}
