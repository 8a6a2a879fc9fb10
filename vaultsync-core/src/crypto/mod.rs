//! Cryptographic primitives for the vault.
//!
//! This module provides:
//! - Argon2id key derivation for the master passphrase
//! - AES-256-GCM sealing of records and whole-vault blobs
//! - Key wrapping and HKDF sub-key derivation
//! - Zeroization utilities

pub mod cipher;
pub mod envelope;
pub mod kdf;
pub mod keyring;
pub mod zero;

pub use cipher::{SubKey, VaultKey};
pub use envelope::{open, seal, Envelope, ENVELOPE_FORMAT_VERSION};
pub use kdf::{derive_master_key, KdfParams};
pub use keyring::{
    with_key, KeyHierarchy, KeyProvider, MasterKey, PassphraseKeyProvider, StaticKeyProvider,
    WrappedKey,
};
pub use zero::SecureBuffer;

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,

    #[error("Malformed envelope: {0}")]
    Format(String),

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
