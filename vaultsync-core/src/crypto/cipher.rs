//! Symmetric key types.
//!
//! The vault key is a random 256-bit AES key. It is never used directly to
//! encrypt data; HKDF-SHA256 derives a separate sub-key per purpose so that a
//! record envelope can never be replayed as a sync blob and vice versa.

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{KeyInit, OsRng},
    Aes256Gcm,
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

/// HKDF info label for locally stored records.
pub const RECORD_KEY_INFO: &[u8] = b"vaultsync-record-v1";

/// HKDF info label for the whole-vault sync blob.
pub const BLOB_KEY_INFO: &[u8] = b"vaultsync-blob-v1";

/// The unwrapped vault key handed out by a [`KeyProvider`](super::KeyProvider).
///
/// Wiped from memory when dropped.
#[derive(ZeroizeOnDrop)]
pub struct VaultKey {
    key: [u8; 32],
}

impl VaultKey {
    /// Generate a new random vault key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self { key: key.into() }
    }

    /// Create a vault key from raw bytes (use with caution)
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Create a vault key from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        })?;
        Ok(Self { key })
    }

    /// Get the raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Derive the sub-key used to seal records in the local store.
    pub fn record_key(&self) -> Result<SubKey> {
        self.derive(RECORD_KEY_INFO)
    }

    /// Derive the sub-key used to seal the vault blob uploaded to the provider.
    pub fn blob_key(&self) -> Result<SubKey> {
        self.derive(BLOB_KEY_INFO)
    }

    fn derive(&self, info: &[u8]) -> Result<SubKey> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.key);
        // Expand in place so the only copy is the one wiped on drop.
        let mut sub = SubKey { key: [0u8; 32] };
        hkdf.expand(info, &mut sub.key)
            .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;
        Ok(sub)
    }
}

/// A purpose-bound key derived from the vault key.
#[derive(ZeroizeOnDrop)]
pub struct SubKey {
    key: [u8; 32],
}

impl SubKey {
    /// Create a sub-key from raw bytes (tests and key rotation only)
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}
