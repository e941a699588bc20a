//! AES-256-GCM block encryption with a password-derived key.
//!
//! [`Encryption`] only wraps an [`Integrity`] layer, so everything above it
//! sees plaintext and everything beneath it, starting with the integrity
//! digests, sees ciphertext. Each block is stored as `nonce || ciphertext ||
//! tag` with the block pointer bound in as associated data.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::block::BlockStorage;
use crate::error::{StorageError, StorageResult};
use crate::integrity::Integrity;

/// Nonce length for AES-256-GCM.
pub const NONCE_LEN: usize = 12;
/// Authentication tag length for AES-256-GCM.
pub const TAG_LEN: usize = 16;
/// Bytes added to every block by encryption.
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

const KDF_SALT: &[u8] = b"utahfs-password-kdf-v1";
const KDF_INFO: &[u8] = b"utahfs-block-encryption";

/// 256-bit (32-byte) encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl EncryptionKey {
    /// Derive the block key from `password` using HKDF-SHA256.
    ///
    /// Fails with `MissingCredential` for an empty password.
    pub fn from_password(password: &str) -> StorageResult<Self> {
        if password.is_empty() {
            return Err(StorageError::MissingCredential { what: "password" });
        }
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), password.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(KDF_INFO, &mut okm)
            .map_err(|e| StorageError::init_failed("encryption", e))?;
        Ok(EncryptionKey(okm))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// Encryption layer over an integrity-protected block store.
pub struct Encryption<B: BlockStorage> {
    inner: Integrity<B>,
    cipher: Aes256Gcm,
}

impl<B: BlockStorage> Encryption<B> {
    /// Wrap `inner` with a key derived from `password`.
    pub fn new(inner: Integrity<B>, password: &str) -> StorageResult<Self> {
        let key = EncryptionKey::from_password(password)?;
        Self::with_key(inner, &key)
    }

    /// Wrap `inner` with an explicit key.
    pub fn with_key(inner: Integrity<B>, key: &EncryptionKey) -> StorageResult<Self> {
        if inner.payload_capacity() <= OVERHEAD {
            return Err(StorageError::init_failed(
                "encryption",
                format!(
                    "block capacity {} cannot hold {} bytes of nonce and tag",
                    inner.payload_capacity(),
                    OVERHEAD
                ),
            ));
        }
        let cipher = Aes256Gcm::new_from_slice(&key.0)
            .map_err(|e| StorageError::init_failed("encryption", e))?;
        info!(capacity = inner.payload_capacity() - OVERHEAD, "created encryption layer");
        Ok(Self { inner, cipher })
    }

    /// Returns the integrity layer beneath.
    pub fn integrity(&self) -> &Integrity<B> {
        &self.inner
    }
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[async_trait]
impl<B: BlockStorage> BlockStorage for Encryption<B> {
    async fn read_block(&self, ptr: u64) -> StorageResult<Vec<u8>> {
        let stored = self.inner.read_block(ptr).await?;
        if stored.len() < OVERHEAD {
            warn!(ptr, len = stored.len(), "ciphertext shorter than nonce and tag");
            return Err(StorageError::DecryptionFailed { ptr });
        }
        let (nonce, ciphertext) = stored.split_at(NONCE_LEN);
        let aad = ptr.to_le_bytes();
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                warn!(ptr, "block failed to decrypt");
                StorageError::DecryptionFailed { ptr }
            })
    }

    async fn write_block(&self, ptr: u64, payload: Vec<u8>) -> StorageResult<()> {
        if payload.len() > self.payload_capacity() {
            return Err(StorageError::PayloadTooLarge {
                len: payload.len(),
                capacity: self.payload_capacity(),
            });
        }
        let nonce = random_nonce();
        let aad = ptr.to_le_bytes();
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &payload,
                    aad: &aad,
                },
            )
            .map_err(|e| StorageError::Serialization {
                reason: format!("encrypting block {}: {}", ptr, e),
            })?;
        let mut stored = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        stored.extend_from_slice(&nonce);
        stored.extend_from_slice(&ciphertext);
        self.inner.write_block(ptr, stored).await
    }

    async fn delete_block(&self, ptr: u64) -> StorageResult<()> {
        self.inner.delete_block(ptr).await
    }

    fn payload_capacity(&self) -> usize {
        self.inner.payload_capacity() - OVERHEAD
    }

    async fn flush(&self) -> StorageResult<()> {
        self.inner.flush().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}
