//! Error types for the storage layers.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A secret needed to build a security layer was not supplied.
    #[error("Missing credential: {what}")]
    MissingCredential {
        /// Which credential is missing.
        what: &'static str,
    },

    /// The remote backend could not serve the request.
    #[error("Backend unavailable: {reason}")]
    BackendUnavailable {
        /// Description of the failure.
        reason: String,
        /// Whether the backend classified the failure as transient.
        transient: bool,
    },

    /// A storage layer could not be constructed.
    #[error("Storage init failed in {layer} layer: {reason}")]
    StorageInitFailed {
        /// The layer that failed.
        layer: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// Stored bytes disagree with their pinned digest.
    #[error("Integrity violation on block {ptr}: {reason}")]
    IntegrityViolation {
        /// The block pointer that failed verification.
        ptr: u64,
        /// Description of the disagreement.
        reason: String,
    },

    /// The AEAD tag did not verify; usually a wrong password.
    #[error("Decryption failed on block {ptr}")]
    DecryptionFailed {
        /// The block pointer that failed to decrypt.
        ptr: u64,
    },

    /// The requested key or block does not exist.
    #[error("Not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A stored block frame is malformed.
    #[error("Corrupted block {ptr}: {reason}")]
    Corrupted {
        /// The block pointer with the malformed frame.
        ptr: u64,
        /// Description of the corruption.
        reason: String,
    },

    /// A payload does not fit in a single block.
    #[error("Payload too large: {len} bytes, block capacity is {capacity}")]
    PayloadTooLarge {
        /// Payload length in bytes.
        len: usize,
        /// Maximum payload length in bytes.
        capacity: usize,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Convenience constructor for a transient backend failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        StorageError::BackendUnavailable {
            reason: reason.into(),
            transient: true,
        }
    }

    /// Convenience constructor for a permanent backend failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        StorageError::BackendUnavailable {
            reason: reason.into(),
            transient: false,
        }
    }

    /// Convenience constructor for a layer construction failure.
    pub fn init_failed(layer: &'static str, reason: impl ToString) -> Self {
        StorageError::StorageInitFailed {
            layer,
            reason: reason.to_string(),
        }
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::BackendUnavailable {
                transient: true,
                ..
            }
        )
    }

    /// Returns true for failures that mean stored data cannot be trusted.
    ///
    /// These are never retried.
    pub fn is_trust_violation(&self) -> bool {
        matches!(
            self,
            StorageError::IntegrityViolation { .. } | StorageError::DecryptionFailed { .. }
        )
    }

    /// Returns true if this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization {
            reason: e.to_string(),
        }
    }
}
