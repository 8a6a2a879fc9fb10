//! VaultSync Core Library
//!
//! Local-first encrypted credential vault with multi-device sync through an
//! untrusted blob store: envelope encryption, an encrypted entry store,
//! snapshot conflict resolution, the sync engine and access anomaly tracking.

pub mod access;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod database;
pub mod merge;
pub mod platform;
pub mod store;
pub mod sync;

pub use access::{AccessTracker, AccessType, AnomalyConfig, AnomalyEvent};
pub use audit::{AuditEventType, AuditLogger};
pub use config::Settings;
pub use crypto::{CryptoError, KdfParams, KeyProvider, VaultKey};
pub use database::DatabaseError;
pub use merge::{ConflictRecord, ConflictResolver, MergeOutcome, MergeStrategy, Resolution};
pub use platform::{
    ensure_data_dir, get_config_dir, get_data_dir, get_default_config_path,
    get_default_vault_path,
};
pub use store::{EntryDraft, EntryKind, EntryStore, Folder, StoreError, VaultEntry, VaultSnapshot};
pub use sync::{SyncEngine, SyncError, SyncOptions, SyncReport};

use thiserror::Error;

/// Result type for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// General error type for vault operations
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Access log error: {0}")]
    Access(#[from] access::AccessError),

    #[error("Audit log error: {0}")]
    Audit(#[from] audit::AuditError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
