//! Local write-ahead log in front of the remote object store.
//!
//! A committed batch is written to its own file under the WAL directory and
//! fsynced before `commit` returns, so a write is durable before it reaches
//! the backend. A background task drains batches to the backend oldest
//! first and deletes each batch file once every write in it has landed.
//!
//! The log holds at most `max_entries` un-drained writes. A commit that
//! would exceed the bound waits for the drainer to make room.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::object::ObjectStorage;
use crate::reliable::{ReliableStorage, WriteBatch};

const BATCH_EXT: &str = "wal";
const TMP_EXT: &str = "tmp";

/// Configuration for the write-ahead log.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Maximum number of un-drained writes held in the log.
    pub max_entries: usize,
    /// Delay before retrying a failed drain (default: 100ms).
    pub drain_backoff: Duration,
    /// Upper bound for the drain retry delay (default: 10 seconds).
    pub max_drain_backoff: Duration,
}

impl WalConfig {
    /// Config with the given entry bound and default backoff.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Self::default()
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_entries: 64 * 512,
            drain_backoff: Duration::from_millis(100),
            max_drain_backoff: Duration::from_secs(10),
        }
    }
}

/// Statistics for the write-ahead log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalStats {
    /// Writes recorded locally but not yet drained.
    pub pending_entries: usize,
    /// Batches recorded locally but not yet drained.
    pub pending_batches: usize,
    /// Batches committed since open.
    pub batches_committed: u64,
    /// Batches drained to the backend since open.
    pub batches_drained: u64,
    /// Batches replayed from disk at open.
    pub batches_recovered: u64,
    /// Failed drain attempts.
    pub drain_errors: u64,
}

/// One committed batch, as stored on disk.
#[derive(Debug, Serialize, Deserialize)]
struct WalBatch {
    seq: u64,
    writes: WriteBatch,
}

impl WalBatch {
    fn encode(&self) -> StorageResult<Vec<u8>> {
        let mut bytes = bincode::serialize(self)?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < 4 {
            return Err(StorageError::Serialization {
                reason: format!("batch file too short: {} bytes", bytes.len()),
            });
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(trailer);
        let expected = u32::from_le_bytes(crc);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StorageError::Serialization {
                reason: format!(
                    "batch checksum mismatch: expected {:#x}, actual {:#x}",
                    expected, actual
                ),
            });
        }
        Ok(bincode::deserialize(body)?)
    }
}

#[derive(Default)]
struct WalState {
    batches: BTreeMap<u64, Arc<WalBatch>>,
    /// Newest un-drained batch holding each key.
    index: HashMap<String, u64>,
    next_seq: u64,
    stats: WalStats,
}

impl WalState {
    fn lookup(&self, key: &str) -> Option<Option<Vec<u8>>> {
        let seq = self.index.get(key)?;
        let batch = self.batches.get(seq)?;
        batch.writes.get(key).cloned()
    }

    fn insert(&mut self, batch: Arc<WalBatch>) {
        for key in batch.writes.keys() {
            let newest = self.index.entry(key.clone()).or_insert(batch.seq);
            if *newest < batch.seq {
                *newest = batch.seq;
            }
        }
        self.stats.pending_entries += batch.writes.len();
        self.stats.pending_batches += 1;
        self.next_seq = self.next_seq.max(batch.seq + 1);
        self.batches.insert(batch.seq, batch);
    }

    fn retire(&mut self, seq: u64) {
        if let Some(batch) = self.batches.remove(&seq) {
            for key in batch.writes.keys() {
                if self.index.get(key) == Some(&seq) {
                    self.index.remove(key);
                }
            }
            self.stats.pending_entries -= batch.writes.len();
            self.stats.pending_batches -= 1;
            self.stats.batches_drained += 1;
        }
    }
}

struct WalInner {
    dir: PathBuf,
    backend: Box<dyn ObjectStorage>,
    config: WalConfig,
    state: Mutex<WalState>,
    commit_lock: tokio::sync::Mutex<()>,
    /// Wakes the drain task.
    wake: Notify,
    /// Signalled whenever a batch is drained.
    drained: Notify,
    shutdown: AtomicBool,
}

impl WalInner {
    fn batch_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{:020}.{}", seq, BATCH_EXT))
    }

    fn oldest(&self) -> Option<Arc<WalBatch>> {
        self.state.lock().batches.values().next().cloned()
    }

    async fn wait_for_space(&self, entries: usize) {
        loop {
            let notified = self.drained.notified();
            {
                let state = self.state.lock();
                let pending = state.stats.pending_entries;
                if pending == 0 || pending + entries <= self.config.max_entries {
                    return;
                }
                debug!(
                    pending,
                    entries,
                    max_entries = self.config.max_entries,
                    "wal full, waiting for drain"
                );
            }
            notified.await;
        }
    }

    async fn persist(&self, batch: &WalBatch) -> StorageResult<()> {
        let bytes = batch.encode()?;
        let tmp = self.dir.join(format!("{:020}.{}", batch.seq, TMP_EXT));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.batch_path(batch.seq)).await?;
        sync_dir(&self.dir).await?;
        Ok(())
    }

    async fn apply(&self, batch: &WalBatch) -> StorageResult<()> {
        for (key, value) in &batch.writes {
            match value {
                Some(data) => self.backend.put(key, data.clone()).await?,
                None => match self.backend.delete(key).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }

    /// Drain one batch: push its writes to the backend, then delete its file.
    ///
    /// The file is removed strictly before the in-memory entry so a restart
    /// never replays a batch older than one already retired.
    async fn drain_one(&self, batch: &WalBatch) -> StorageResult<()> {
        self.apply(batch).await?;
        match tokio::fs::remove_file(self.batch_path(batch.seq)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.state.lock().retire(batch.seq);
        debug!(seq = batch.seq, writes = batch.writes.len(), "drained wal batch");
        self.drained.notify_waiters();
        Ok(())
    }
}

async fn drain_loop(inner: Arc<WalInner>) {
    let mut backoff = inner.config.drain_backoff;
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let Some(batch) = inner.oldest() else {
            inner.wake.notified().await;
            continue;
        };
        match inner.drain_one(&batch).await {
            Ok(()) => backoff = inner.config.drain_backoff,
            Err(e) => {
                inner.state.lock().stats.drain_errors += 1;
                warn!(
                    seq = batch.seq,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "wal drain failed, will retry"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2).min(inner.config.max_drain_backoff);
            }
        }
    }
    debug!(dir = %inner.dir.display(), "wal drain task stopped");
}

/// Write-ahead log implementing [`ReliableStorage`] over an object store.
pub struct Wal {
    inner: Arc<WalInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Open (or create) the log at `dir` in front of `backend`.
    ///
    /// Fails with `StorageInitFailed` if `max_entries` is not positive or the
    /// directory cannot be used.
    pub async fn open(
        backend: Box<dyn ObjectStorage>,
        dir: impl AsRef<Path>,
        max_entries: i64,
    ) -> StorageResult<Self> {
        if max_entries <= 0 {
            return Err(StorageError::init_failed(
                "wal",
                format!("max entries must be positive, got {}", max_entries),
            ));
        }
        Self::open_with_config(
            backend,
            dir,
            WalConfig::with_max_entries(max_entries as usize),
        )
        .await
    }

    /// Open the log with an explicit configuration.
    pub async fn open_with_config(
        backend: Box<dyn ObjectStorage>,
        dir: impl AsRef<Path>,
        config: WalConfig,
    ) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if config.max_entries == 0 {
            return Err(StorageError::init_failed("wal", "max entries must be positive"));
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::init_failed("wal", format!("{}: {}", dir.display(), e)))?;

        let state = recover(&dir).await?;
        let recovered = state.stats.batches_recovered;
        let pending_entries = state.stats.pending_entries;

        let inner = Arc::new(WalInner {
            dir,
            backend,
            config,
            state: Mutex::new(state),
            commit_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            drained: Notify::new(),
            shutdown: AtomicBool::new(false),
        });
        let task = tokio::spawn(drain_loop(inner.clone()));
        if recovered > 0 {
            inner.wake.notify_one();
        }

        info!(
            dir = %inner.dir.display(),
            max_entries = inner.config.max_entries,
            recovered,
            pending_entries,
            "opened write-ahead log"
        );
        Ok(Self {
            inner,
            task: Mutex::new(Some(task)),
        })
    }

    /// Returns a snapshot of the log statistics.
    pub fn stats(&self) -> WalStats {
        self.inner.state.lock().stats.clone()
    }

    /// Returns the directory holding the batch files.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Wait until every committed batch has reached the backend.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.state.lock().batches.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fsync `dir` so a rename inside it survives power loss.
pub(crate) async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    if cfg!(unix) {
        tokio::fs::File::open(dir).await?.sync_all().await?;
    }
    Ok(())
}

async fn recover(dir: &Path) -> StorageResult<WalState> {
    let mut state = WalState {
        next_seq: 1,
        ..WalState::default()
    };
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| StorageError::init_failed("wal", format!("{}: {}", dir.display(), e)))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StorageError::init_failed("wal", e))?
    {
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some(TMP_EXT) => {
                debug!(path = %path.display(), "discarding incomplete wal batch");
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| StorageError::init_failed("wal", e))?;
            }
            Some(BATCH_EXT) => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| StorageError::init_failed("wal", e))?;
                let batch = WalBatch::decode(&bytes).map_err(|e| {
                    StorageError::init_failed("wal", format!("{}: {}", path.display(), e))
                })?;
                state.insert(Arc::new(batch));
                state.stats.batches_recovered += 1;
            }
            _ => {}
        }
    }
    Ok(state)
}

#[async_trait]
impl ReliableStorage for Wal {
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let pending = self.inner.state.lock().lookup(key);
        match pending {
            Some(Some(data)) => Ok(data),
            Some(None) => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            None => self.inner.backend.get(key).await,
        }
    }

    async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.inner.commit_lock.lock().await;
        let entries = batch.len();
        self.inner.wait_for_space(entries).await;

        let seq = self.inner.state.lock().next_seq;
        let batch = Arc::new(WalBatch { seq, writes: batch });
        self.inner.persist(&batch).await?;
        {
            let mut state = self.inner.state.lock();
            state.insert(batch);
            state.stats.batches_committed += 1;
        }
        self.inner.wake.notify_one();
        debug!(seq, entries, "committed wal batch");
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.wait_drained().await;
        self.stop();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "wal drain task ended abnormally");
            }
        }
        info!(dir = %self.inner.dir.display(), "closed write-ahead log");
        Ok(())
    }
}
