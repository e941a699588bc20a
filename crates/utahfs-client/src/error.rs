//! Errors surfaced while loading configuration and composing the stack.

use thiserror::Error;
use utahfs_fs::FsError;
use utahfs_persistent::StorageError;

/// Result type alias for client operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Error variants for configuration and composition.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A mandatory secret is absent or empty.
    #[error("Missing credential: {what}")]
    MissingCredential {
        /// Which credential is missing.
        what: &'static str,
    },

    /// Neither credential group has any field set.
    #[error("No object storage provider defined")]
    NoProviderConfigured,

    /// Both credential groups have at least one field set.
    #[error("Only one object storage provider may be defined")]
    AmbiguousProvider,

    /// A storage layer failed, during construction or at runtime.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The file layer failed for a reason of its own.
    #[error(transparent)]
    Fs(FsError),

    /// The configuration document is not valid YAML for this schema.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FsError> for ConfigError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Storage(e) => ConfigError::Storage(e),
            other => ConfigError::Fs(other),
        }
    }
}

impl ConfigError {
    /// Returns the storage error beneath, if any.
    pub fn storage(&self) -> Option<&StorageError> {
        match self {
            ConfigError::Storage(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the name of the layer that failed to initialize, if any.
    pub fn failed_layer(&self) -> Option<&'static str> {
        match self.storage() {
            Some(StorageError::StorageInitFailed { layer, .. }) => Some(*layer),
            _ => None,
        }
    }

    /// True when stored data was tampered with or the key is wrong.
    pub fn is_trust_violation(&self) -> bool {
        match self {
            ConfigError::Storage(e) => e.is_trust_violation(),
            ConfigError::Fs(e) => e.is_trust_violation(),
            _ => false,
        }
    }
}
