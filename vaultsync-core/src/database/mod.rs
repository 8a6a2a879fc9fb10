//! SQLite persistence for the encrypted vault.
//!
//! Entry and folder rows hold sealed envelopes only. Clock marks, device acks
//! and sync bookkeeping are stored in plain columns because they carry no
//! secret content.

pub mod schema;

pub use schema::{Database, CURRENT_SCHEMA_VERSION};

use thiserror::Error;

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },

    #[error("Vault metadata missing")]
    MetadataMissing,
}
