//! Database schema and connection management.

use crate::database::{DatabaseError, Result};
use rusqlite::Connection;
use std::path::Path;

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Main database connection and schema manager
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self { conn })
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self { conn })
    }

    /// Create all tables for a new vault
    pub fn initialize_schema(&self) -> Result<()> {
        self.create_vault_metadata_table()?;
        self.create_record_tables()?;
        self.create_clock_tables()?;
        self.create_sync_metadata_table()?;
        Ok(())
    }

    fn create_vault_metadata_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                device_id TEXT NOT NULL,
                kdf_params BLOB,
                wrapped_key BLOB,
                revision INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_modified INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn create_record_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                entry_id TEXT PRIMARY KEY,
                envelope BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS folders (
                folder_id TEXT PRIMARY KEY,
                envelope BLOB NOT NULL
            );",
        )?;
        Ok(())
    }

    fn create_clock_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS clock_map (
                device_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS device_acks (
                device_id TEXT PRIMARY KEY,
                clock TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn create_sync_metadata_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                blob_id TEXT,
                remote_revision TEXT,
                last_sync_at INTEGER,
                last_conflict_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        Ok(())
    }

    /// Validate the stored schema version against this build.
    pub fn validate_schema_version(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .query_row("SELECT version FROM vault_metadata WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DatabaseError::MetadataMissing,
                other => DatabaseError::Sqlite(other),
            })?;

        if version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        Err(DatabaseError::SchemaMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: version,
        })
    }

    /// Get a reference to the underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, needed to open transactions.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
