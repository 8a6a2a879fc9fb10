//! Encrypted whole-vault sync through a dumb blob store.
//!
//! Each device keeps its own [`EntryStore`](crate::store::EntryStore). A sync
//! cycle downloads the sealed remote snapshot, merges it with the local one,
//! persists the result and publishes it back with a conditional upload:
//! - the provider only ever stores ciphertext
//! - conflicting uploads are detected by revision tag and the cycle restarts
//! - transport failures are retried with exponential backoff

pub mod config;
pub mod crypto;
pub mod engine;
pub mod models;
pub mod transport;

#[cfg(test)]
mod tests;

pub use config::SyncMetadata;
pub use engine::SyncEngine;
pub use models::{RemoteBlob, RetryPolicy, SyncOptions, SyncOutcome, SyncPhase, SyncReport};
pub use transport::{BlobTransport, DirectoryTransport, MemoryTransport, TransportError};

use crate::crypto::CryptoError;
use crate::merge::ResolutionError;
use crate::store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Remote blob failed authentication")]
    AuthenticationFailure,

    #[error("Unsupported or malformed remote data: {0}")]
    Format(String),

    #[error("Remote changed during sync: expected {expected:?}, found {found:?}")]
    VersionConflict {
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("Local storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("A sync is already in progress")]
    AlreadySyncing,

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Conflict resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },
}

impl SyncError {
    /// Whether running the cycle again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::RetriesExhausted { .. } | Self::VersionConflict { .. } | Self::AlreadySyncing => {
                true
            }
            Self::AuthenticationFailure
            | Self::Format(_)
            | Self::StorageCorrupt(_)
            | Self::Store(_)
            | Self::Crypto(_)
            | Self::Resolution(_)
            | Self::Internal(_) => false,
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::VersionConflict { expected, found } => {
                SyncError::VersionConflict { expected, found }
            }
            other => SyncError::Transport(other),
        }
    }
}

impl From<CryptoError> for SyncError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationFailed => SyncError::AuthenticationFailure,
            CryptoError::Format(msg) => SyncError::Format(msg),
            CryptoError::UnsupportedVersion(v) => {
                SyncError::Format(format!("unsupported envelope version {}", v))
            }
            other => SyncError::Crypto(other),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::StorageCorrupt(msg) => SyncError::StorageCorrupt(msg),
            other => SyncError::Store(other),
        }
    }
}
