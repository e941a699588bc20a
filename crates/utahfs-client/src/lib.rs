//! UtahFS client: turns a YAML configuration into a mounted storage stack.
//!
//! [`ClientConfig`] is defaulted and validated into a [`ResolvedConfig`],
//! exactly one remote [`Provider`] is selected and connected through a
//! [`BackendConnector`], and [`compose`] wraps it in every storage layer up to
//! the filesystem.

pub mod compose;
pub mod config;
pub mod error;
pub mod logging;
pub mod provider;

pub use compose::{compose, Layer, Session, UtahFs};
pub use config::{
    ClientConfig, Password, ResolvedConfig, CACHE_DISABLED, DEFAULT_CACHE_SIZE,
    DEFAULT_DATA_DIR_NAME, DEFAULT_DATA_SIZE, DEFAULT_MAX_WAL_SIZE, DEFAULT_NUM_PTRS,
};
pub use error::{ConfigError, ConfigResult};
pub use provider::{
    connect, B2Credentials, BackendConnector, MemoryConnector, Provider, S3Credentials,
    StorageProviderConfig,
};
