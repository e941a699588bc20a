//! Assembly of the full storage stack from a client configuration.
//!
//! Layers are built leaves first, each one taking ownership of the layer
//! beneath it:
//!
//! backend → retry → WAL → cache → buffering → framing → integrity →
//! encryption → application storage → filesystem
//!
//! Retry is added only for a bound above 1 and the cache only when its size
//! is not [`CACHE_DISABLED`](crate::config::CACHE_DISABLED). Any failure
//! aborts the whole composition; a partially built stack is never returned.

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use utahfs_fs::BlockFilesystem;
use utahfs_persistent::{
    AppStorage, BufferedStore, Cache, CacheMetrics, CacheStats, Encryption, Integrity,
    ReliableStorage, RetryStore, SimpleBlock, Wal,
};

use crate::config::{ClientConfig, ResolvedConfig};
use crate::error::ConfigResult;
use crate::provider::{connect, BackendConnector};

/// Filesystem type produced by [`compose`].
pub type UtahFs = BlockFilesystem<Encryption<SimpleBlock>>;

/// One layer of the composed stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Backend,
    Retry,
    Wal,
    Cache,
    Buffering,
    Framing,
    Integrity,
    Encryption,
    AppStorage,
    Filesystem,
}

/// A mounted storage stack.
pub struct Session {
    fs: UtahFs,
    layers: Vec<Layer>,
    cache_metrics: Option<Arc<CacheMetrics>>,
    config: ResolvedConfig,
}

impl Session {
    /// Returns the filesystem at the top of the stack.
    pub fn fs(&self) -> &UtahFs {
        &self.fs
    }

    /// Returns the layers actually composed, from the backend up.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn has_layer(&self, layer: Layer) -> bool {
        self.layers.contains(&layer)
    }

    /// Returns cache statistics, or `None` when the cache is disabled.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache_metrics.as_ref().map(|m| m.snapshot())
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Commit, flush every buffer, persist the pins and drain the WAL.
    pub async fn close(&self) -> ConfigResult<()> {
        self.fs.close().await?;
        info!(data_dir = %self.config.data_dir.display(), "closed session");
        Ok(())
    }
}

/// Build the storage stack described by `config` for a mount at `mount_path`.
pub async fn compose(
    config: &ClientConfig,
    mount_path: impl AsRef<Path>,
    connector: &dyn BackendConnector,
) -> ConfigResult<Session> {
    let resolved = config.resolve(mount_path.as_ref())?;
    let mut layers = vec![Layer::Backend];

    let backend = connect(connector, &resolved.provider).await?;
    let backend = if resolved.retry_attempts > 1 {
        layers.push(Layer::Retry);
        RetryStore::wrap(backend, resolved.retry_attempts)
    } else {
        backend
    };

    let wal = Wal::open(backend, resolved.wal_dir(), resolved.max_wal_size).await?;
    layers.push(Layer::Wal);

    let mut cache_metrics = None;
    let reliable: Box<dyn ReliableStorage> = if resolved.cache_enabled() {
        let cache = Cache::new(Box::new(wal), resolved.cache_size)?;
        cache_metrics = Some(cache.metrics());
        layers.push(Layer::Cache);
        Box::new(cache)
    } else {
        Box::new(wal)
    };

    let buffered = BufferedStore::new(reliable);
    layers.push(Layer::Buffering);
    let block = SimpleBlock::new(buffered);
    layers.push(Layer::Framing);

    let integrity = Integrity::open(block, resolved.pin_path()).await?;
    layers.push(Layer::Integrity);
    let encrypted = Encryption::new(integrity, resolved.password.expose())?;
    layers.push(Layer::Encryption);

    let app = AppStorage::open(encrypted).await?;
    layers.push(Layer::AppStorage);
    let fs = BlockFilesystem::new(app, resolved.num_ptrs, resolved.data_size)?;
    layers.push(Layer::Filesystem);

    info!(
        provider = resolved.provider.name(),
        data_dir = %resolved.data_dir.display(),
        layers = ?layers,
        "composed storage stack"
    );
    Ok(Session {
        fs,
        layers,
        cache_metrics,
        config: resolved,
    })
}
