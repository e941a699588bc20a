//! Error types for the filesystem layer.

use thiserror::Error;
use utahfs_persistent::StorageError;

/// Errors returned by filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// A storage layer beneath failed; its error is passed through unchanged.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No file with this id exists.
    #[error("File not found: {id}")]
    NotFound {
        /// The file id that was looked up.
        id: u64,
    },

    /// An argument was out of range.
    #[error("Invalid argument: {msg}")]
    InvalidArgument {
        /// What was wrong with the argument.
        msg: String,
    },

    /// A file's node structure is inconsistent.
    #[error("File {id} is corrupted: {reason}")]
    Corrupted {
        /// The file whose nodes are inconsistent.
        id: u64,
        /// Description of the inconsistency.
        reason: String,
    },
}

/// Result type alias for filesystem operations.
pub type FsResult<T> = std::result::Result<T, FsError>;

impl FsError {
    /// True when the storage beneath reported tampering or a wrong key.
    pub fn is_trust_violation(&self) -> bool {
        matches!(self, FsError::Storage(e) if e.is_trust_violation())
    }

    /// True when the file, or an object beneath it, does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            FsError::NotFound { .. } => true,
            FsError::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }
}
