//! Sync bookkeeping stored in the local database.

use serde::{Deserialize, Serialize};

use crate::database::{DatabaseError, Result};

/// What this device remembers about the last successful sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub blob_id: Option<String>,
    /// Revision tag of the remote blob as of the last sync.
    pub remote_revision: Option<String>,
    /// Unix milliseconds.
    pub last_sync_at: Option<i64>,
    pub last_conflict_count: u32,
}

impl SyncMetadata {
    /// Load sync metadata from the database. Returns default if no row exists.
    pub fn load(conn: &rusqlite::Connection) -> Result<Self> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='sync_metadata')",
            [],
            |row| row.get(0),
        )?;

        if !exists {
            return Ok(Self::default());
        }

        let result = conn.query_row(
            "SELECT blob_id, remote_revision, last_sync_at, last_conflict_count
             FROM sync_metadata WHERE id = 1",
            [],
            |row| {
                let last_conflict_count: i64 = row.get(3)?;
                Ok(SyncMetadata {
                    blob_id: row.get(0)?,
                    remote_revision: row.get(1)?,
                    last_sync_at: row.get(2)?,
                    last_conflict_count: last_conflict_count as u32,
                })
            },
        );

        match result {
            Ok(metadata) => Ok(metadata),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Self::default()),
            Err(e) => Err(DatabaseError::Sqlite(e)),
        }
    }

    /// Save sync metadata to the database (upsert).
    pub fn save(&self, conn: &rusqlite::Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO sync_metadata (id, blob_id, remote_revision, last_sync_at, last_conflict_count)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                blob_id = excluded.blob_id,
                remote_revision = excluded.remote_revision,
                last_sync_at = excluded.last_sync_at,
                last_conflict_count = excluded.last_conflict_count",
            rusqlite::params![
                self.blob_id,
                self.remote_revision,
                self.last_sync_at,
                self.last_conflict_count as i64,
            ],
        )?;

        Ok(())
    }
}
