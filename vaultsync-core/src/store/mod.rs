//! Encrypted entry store.
//!
//! Every entry and folder is sealed individually with the record sub-key and
//! kept in SQLite. A decrypted [`VaultSnapshot`] is held in memory behind a
//! mutex and only updated after the corresponding transaction commits, so the
//! in-memory view and the database never disagree about a committed write.

pub mod models;

#[cfg(test)]
mod tests;

pub use models::{
    CausalOrder, ClockMap, DeviceId, EntryDraft, EntryKind, Folder, SnapshotFormatError,
    VaultEntry, VaultSnapshot, SNAPSHOT_SCHEMA_VERSION,
};

use crate::access::{AccessTracker, AccessType};
use crate::crypto::{
    envelope::{open_from_bytes, seal_to_bytes},
    with_key, CryptoError, KdfParams, KeyHierarchy, KeyProvider, PassphraseKeyProvider,
    WrappedKey,
};
use crate::database::{Database, DatabaseError, CURRENT_SCHEMA_VERSION};
use crate::sync::config::SyncMetadata;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Entry not found: {0}")]
    NotFound(Uuid),

    #[error("Folder not found: {0}")]
    FolderNotFound(Uuid),

    #[error("Entry {0} is deleted")]
    Tombstoned(Uuid),

    /// An optimistic check failed. `entry` is `None` when the check was on the
    /// store revision rather than on a single entry.
    #[error("Version conflict: expected {expected}, found {found}")]
    VersionConflict {
        entry: Option<Uuid>,
        expected: u64,
        found: u64,
    },

    #[error("Storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(DatabaseError::Sqlite(e))
    }
}

struct StoreState {
    db: Database,
    snapshot: VaultSnapshot,
    revision: u64,
    /// Last logical timestamp handed out by this device.
    last_timestamp: i64,
}

pub struct EntryStore {
    state: Mutex<StoreState>,
    keys: Box<dyn KeyProvider>,
    device_id: DeviceId,
    tracker: Option<Arc<AccessTracker>>,
}

impl EntryStore {
    /// Create a new passphrase-protected vault at `path`.
    pub fn create_vault<P: AsRef<Path>>(
        path: P,
        device_id: &str,
        passphrase: &[u8],
        kdf_params: KdfParams,
    ) -> Result<Self> {
        kdf_params.validate()?;
        let db = Database::open(path)?;
        db.initialize_schema()?;
        if vault_exists(&db)? {
            return Err(StoreError::InvalidInput(
                "a vault already exists at this path".to_string(),
            ));
        }

        let (kdf_params, wrapped, master_key) =
            KeyHierarchy::initialize_vault(passphrase, kdf_params)?;
        write_vault_metadata(&db, device_id, Some((&kdf_params, &wrapped)))?;
        info!(device_id, "Created vault");

        let provider = PassphraseKeyProvider::from_parts(master_key, wrapped);
        Self::load(db, Box::new(provider))
    }

    /// Open an existing passphrase-protected vault.
    pub fn open<P: AsRef<Path>>(path: P, passphrase: &[u8]) -> Result<Self> {
        let db = Database::open(path)?;
        db.validate_schema_version()?;

        let (kdf_params, wrapped) = read_key_material(&db)?;
        let provider = PassphraseKeyProvider::unlock(passphrase, &kdf_params, wrapped)?;
        Self::load(db, Box::new(provider))
    }

    /// Open an existing vault with an externally supplied key provider.
    pub fn open_with_provider(db: Database, keys: Box<dyn KeyProvider>) -> Result<Self> {
        db.validate_schema_version()?;
        Self::load(db, keys)
    }

    /// Initialize a vault in `db` whose key is managed by `keys`.
    pub fn create_with_provider(
        db: Database,
        device_id: &str,
        keys: Box<dyn KeyProvider>,
    ) -> Result<Self> {
        db.initialize_schema()?;
        if vault_exists(&db)? {
            return Err(StoreError::InvalidInput(
                "a vault already exists in this database".to_string(),
            ));
        }
        write_vault_metadata(&db, device_id, None)?;
        Self::load(db, keys)
    }

    /// Fresh in-memory vault.
    pub fn in_memory(device_id: &str, keys: Box<dyn KeyProvider>) -> Result<Self> {
        Self::create_with_provider(Database::in_memory()?, device_id, keys)
    }

    /// Attach an access tracker; reads through [`access`](Self::access) are
    /// recorded from then on.
    pub fn with_access_tracker(mut self, tracker: Arc<AccessTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    fn load(db: Database, keys: Box<dyn KeyProvider>) -> Result<Self> {
        let (device_id, revision): (String, i64) = db.conn().query_row(
            "SELECT device_id, revision FROM vault_metadata WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut snapshot = VaultSnapshot::new();
        with_key(&*keys, |key| -> Result<()> {
            let record_key = key.record_key()?;

            let mut stmt = db.conn().prepare("SELECT entry_id, envelope FROM entries")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (id, envelope) = row?;
                let entry: VaultEntry = open_record(&envelope, &record_key, &id)?;
                if entry.id.to_string() != id {
                    return Err(StoreError::StorageCorrupt(format!(
                        "entry row {} holds record {}",
                        id, entry.id
                    )));
                }
                snapshot.entries.insert(entry.id, entry);
            }

            let mut stmt = db.conn().prepare("SELECT folder_id, envelope FROM folders")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (id, envelope) = row?;
                let folder: Folder = open_record(&envelope, &record_key, &id)?;
                snapshot.folders.insert(folder.id, folder);
            }
            Ok(())
        })?;

        let mut stmt = db.conn().prepare("SELECT device_id, version FROM clock_map")?;
        let marks = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for mark in marks {
            let (device, version) = mark?;
            snapshot.clock.observe(&device, version as u64);
        }
        drop(stmt);

        let mut stmt = db.conn().prepare("SELECT device_id, clock FROM device_acks")?;
        let acks = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for ack in acks {
            let (device, clock) = ack?;
            let clock: ClockMap = serde_json::from_str(&clock)
                .map_err(|e| StoreError::StorageCorrupt(format!("ack for {}: {}", device, e)))?;
            snapshot.acks.insert(device, clock);
        }
        drop(stmt);

        let last_timestamp = snapshot
            .entries
            .values()
            .filter(|e| e.device_id == device_id)
            .map(|e| e.updated_at)
            .max()
            .unwrap_or(0);

        debug!(
            entries = snapshot.entries.len(),
            folders = snapshot.folders.len(),
            revision,
            "Loaded vault"
        );

        Ok(Self {
            state: Mutex::new(StoreState {
                db,
                snapshot,
                revision: revision as u64,
                last_timestamp,
            }),
            keys,
            device_id,
            tracker: None,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn key_provider(&self) -> &dyn KeyProvider {
        &*self.keys
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    // ----- entries -----

    pub fn create(&self, draft: EntryDraft) -> Result<VaultEntry> {
        let kind = draft
            .kind
            .ok_or_else(|| StoreError::InvalidInput("entry kind is required".to_string()))?;

        let mut state = self.lock()?;
        check_folder(&state.snapshot, draft.folder_id)?;

        let now = next_timestamp(&mut state, 0);
        let entry = VaultEntry {
            id: Uuid::new_v4(),
            kind,
            fields: draft.fields,
            folder_id: draft.folder_id,
            tags: draft.tags,
            created_at: now,
            updated_at: now,
            device_id: self.device_id.clone(),
            version: self.next_version(&state, 0),
            tombstone: false,
        };

        self.commit_entry(&mut state, &entry)?;
        debug!(entry_id = %entry.id, version = entry.version, "Created entry");
        Ok(entry)
    }

    /// Live entry by id.
    pub fn get(&self, id: Uuid) -> Result<VaultEntry> {
        let state = self.lock()?;
        match state.snapshot.entries.get(&id) {
            Some(entry) if entry.is_live() => Ok(entry.clone()),
            _ => Err(StoreError::NotFound(id)),
        }
    }

    /// Entry by id, tombstones included.
    pub fn get_any(&self, id: Uuid) -> Result<VaultEntry> {
        let state = self.lock()?;
        state
            .snapshot
            .entries
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Read an entry on behalf of `actor` and record the access.
    ///
    /// Tracking failures are logged and never fail the read.
    pub fn access(&self, id: Uuid, actor: &str, access_type: AccessType) -> Result<VaultEntry> {
        let entry = self.get(id)?;
        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker.track_access(id, actor, access_type) {
                warn!(entry_id = %id, "Failed to record access: {}", e);
            }
        }
        Ok(entry)
    }

    /// Replace an entry's content. With `expected_version`, fails with
    /// `VersionConflict` if the entry moved on in the meantime.
    pub fn update(
        &self,
        id: Uuid,
        draft: EntryDraft,
        expected_version: Option<u64>,
    ) -> Result<VaultEntry> {
        let mut state = self.lock()?;
        let current = live_entry(&state.snapshot, id)?.clone();
        check_expected(id, current.version, expected_version)?;
        check_folder(&state.snapshot, draft.folder_id)?;

        let mut entry = current.clone();
        if let Some(kind) = draft.kind {
            entry.kind = kind;
        }
        entry.fields = draft.fields;
        entry.folder_id = draft.folder_id;
        entry.tags = draft.tags;
        entry.updated_at = next_timestamp(&mut state, current.updated_at);
        entry.device_id = self.device_id.clone();
        entry.version = self.next_version(&state, current.version);

        self.commit_entry(&mut state, &entry)?;
        debug!(entry_id = %id, version = entry.version, "Updated entry");
        Ok(entry)
    }

    /// Tombstone an entry. Content is cleared; id and timestamps are kept.
    pub fn delete(&self, id: Uuid, expected_version: Option<u64>) -> Result<VaultEntry> {
        let mut state = self.lock()?;
        let current = live_entry(&state.snapshot, id)?.clone();
        check_expected(id, current.version, expected_version)?;

        let mut entry = current.clone();
        entry.clear_content();
        entry.tombstone = true;
        entry.updated_at = next_timestamp(&mut state, current.updated_at);
        entry.device_id = self.device_id.clone();
        entry.version = self.next_version(&state, current.version);

        self.commit_entry(&mut state, &entry)?;
        debug!(entry_id = %id, version = entry.version, "Deleted entry");
        Ok(entry)
    }

    /// Bring a tombstoned entry back with explicit content.
    pub fn undelete(&self, id: Uuid, draft: EntryDraft) -> Result<VaultEntry> {
        let mut state = self.lock()?;
        let current = state
            .snapshot
            .entries
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        if current.is_live() {
            return Err(StoreError::InvalidInput(format!(
                "entry {} is not deleted",
                id
            )));
        }
        check_folder(&state.snapshot, draft.folder_id)?;

        let mut entry = current.clone();
        if let Some(kind) = draft.kind {
            entry.kind = kind;
        }
        entry.fields = draft.fields;
        entry.folder_id = draft.folder_id;
        entry.tags = draft.tags;
        entry.tombstone = false;
        entry.updated_at = next_timestamp(&mut state, current.updated_at);
        entry.device_id = self.device_id.clone();
        entry.version = self.next_version(&state, current.version);

        self.commit_entry(&mut state, &entry)?;
        info!(entry_id = %id, version = entry.version, "Restored entry");
        Ok(entry)
    }

    /// All live entries, ordered by id.
    pub fn list(&self) -> Result<Vec<VaultEntry>> {
        let state = self.lock()?;
        Ok(state.snapshot.live_entries().cloned().collect())
    }

    pub fn list_in_folder(&self, folder_id: Uuid) -> Result<Vec<VaultEntry>> {
        let state = self.lock()?;
        Ok(state
            .snapshot
            .live_entries()
            .filter(|e| e.folder_id == Some(folder_id))
            .cloned()
            .collect())
    }

    pub fn list_tagged(&self, tag: &str) -> Result<Vec<VaultEntry>> {
        let state = self.lock()?;
        Ok(state
            .snapshot
            .live_entries()
            .filter(|e| e.tags.contains(tag))
            .cloned()
            .collect())
    }

    // ----- folders -----

    pub fn create_folder(&self, name: &str) -> Result<Folder> {
        let name = validate_folder_name(name)?;
        let mut state = self.lock()?;
        let folder = Folder {
            id: Uuid::new_v4(),
            name,
            updated_at: next_timestamp(&mut state, 0),
            device_id: self.device_id.clone(),
            version: self.next_version(&state, 0),
            tombstone: false,
        };
        self.commit_folder(&mut state, &folder)?;
        Ok(folder)
    }

    pub fn rename_folder(&self, id: Uuid, name: &str) -> Result<Folder> {
        let name = validate_folder_name(name)?;
        let mut state = self.lock()?;
        let current = live_folder(&state.snapshot, id)?.clone();

        let mut folder = current.clone();
        folder.name = name;
        folder.updated_at = next_timestamp(&mut state, current.updated_at);
        folder.device_id = self.device_id.clone();
        folder.version = self.next_version(&state, current.version);

        self.commit_folder(&mut state, &folder)?;
        Ok(folder)
    }

    /// Tombstone a folder. Entries keep their (now dangling) reference.
    pub fn delete_folder(&self, id: Uuid) -> Result<Folder> {
        let mut state = self.lock()?;
        let current = live_folder(&state.snapshot, id)?.clone();

        let mut folder = current.clone();
        folder.tombstone = true;
        folder.updated_at = next_timestamp(&mut state, current.updated_at);
        folder.device_id = self.device_id.clone();
        folder.version = self.next_version(&state, current.version);

        self.commit_folder(&mut state, &folder)?;
        Ok(folder)
    }

    pub fn list_folders(&self) -> Result<Vec<Folder>> {
        let state = self.lock()?;
        Ok(state
            .snapshot
            .folders
            .values()
            .filter(|f| !f.tombstone)
            .cloned()
            .collect())
    }

    // ----- snapshots -----

    /// Immutable copy of the whole vault plus the revision it was taken at.
    pub fn snapshot(&self) -> Result<(VaultSnapshot, u64)> {
        let state = self.lock()?;
        Ok((state.snapshot.clone(), state.revision))
    }

    pub fn revision(&self) -> Result<u64> {
        Ok(self.lock()?.revision)
    }

    /// Replace the vault contents with `snapshot` in one transaction.
    pub fn apply_merged(&self, snapshot: VaultSnapshot) -> Result<u64> {
        let mut state = self.lock()?;
        self.replace_state(&mut state, snapshot)
    }

    /// Like [`apply_merged`](Self::apply_merged), but only if no local write
    /// landed since the snapshot at `base_revision` was taken.
    pub fn apply_merged_at(&self, snapshot: VaultSnapshot, base_revision: u64) -> Result<u64> {
        let mut state = self.lock()?;
        if state.revision != base_revision {
            return Err(StoreError::VersionConflict {
                entry: None,
                expected: base_revision,
                found: state.revision,
            });
        }
        self.replace_state(&mut state, snapshot)
    }

    /// Record this device's current clock as its ack.
    pub fn record_ack(&self) -> Result<()> {
        let mut state = self.lock()?;
        let clock = state.snapshot.clock.clone();
        let clock_json = serde_json::to_string(&clock)?;

        let tx = state.db.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO device_acks (device_id, clock) VALUES (?1, ?2)
             ON CONFLICT(device_id) DO UPDATE SET clock = excluded.clock",
            params![self.device_id, clock_json],
        )?;
        let revision = bump_revision(&tx)?;
        tx.commit()?;

        state.revision = revision;
        state.snapshot.acks.insert(self.device_id.clone(), clock);
        Ok(())
    }

    /// Physically remove tombstones older than `retention` that every known
    /// device has acknowledged. Returns the ids that were purged.
    pub fn purge_tombstones(&self, now: i64, retention: Duration) -> Result<Vec<Uuid>> {
        let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention_ms);

        let mut state = self.lock()?;
        let snapshot = &state.snapshot;
        let acknowledged = |device: &str, version: u64| {
            snapshot.clock.covers(device, version)
                && snapshot.acks.values().all(|ack| ack.covers(device, version))
        };

        let entry_ids: Vec<Uuid> = snapshot
            .entries
            .values()
            .filter(|e| e.tombstone && e.updated_at <= cutoff)
            .filter(|e| acknowledged(&e.device_id, e.version))
            .map(|e| e.id)
            .collect();
        let folder_ids: Vec<Uuid> = snapshot
            .folders
            .values()
            .filter(|f| f.tombstone && f.updated_at <= cutoff)
            .filter(|f| acknowledged(&f.device_id, f.version))
            .map(|f| f.id)
            .collect();

        if entry_ids.is_empty() && folder_ids.is_empty() {
            return Ok(Vec::new());
        }

        let tx = state.db.conn_mut().transaction()?;
        for id in &entry_ids {
            tx.execute("DELETE FROM entries WHERE entry_id = ?1", [id.to_string()])?;
        }
        for id in &folder_ids {
            tx.execute("DELETE FROM folders WHERE folder_id = ?1", [id.to_string()])?;
        }
        let revision = bump_revision(&tx)?;
        tx.commit()?;

        state.revision = revision;
        for id in &entry_ids {
            state.snapshot.entries.remove(id);
        }
        for id in &folder_ids {
            state.snapshot.folders.remove(id);
        }

        info!(
            entries = entry_ids.len(),
            folders = folder_ids.len(),
            "Purged tombstones"
        );
        Ok(entry_ids)
    }

    // ----- sync bookkeeping -----

    pub fn sync_metadata(&self) -> Result<SyncMetadata> {
        let state = self.lock()?;
        Ok(SyncMetadata::load(state.db.conn())?)
    }

    pub fn save_sync_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
        let state = self.lock()?;
        metadata.save(state.db.conn())?;
        Ok(())
    }

    // ----- internals -----

    fn next_version(&self, state: &StoreState, current: u64) -> u64 {
        current.max(state.snapshot.clock.get(&self.device_id)) + 1
    }

    fn seal<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        with_key(&*self.keys, |key| {
            Ok(seal_to_bytes(&plaintext, &key.record_key()?)?)
        })
    }

    fn commit_entry(&self, state: &mut StoreState, entry: &VaultEntry) -> Result<()> {
        let envelope = self.seal(entry)?;

        let tx = state.db.conn_mut().transaction()?;
        write_entry_row(&tx, entry.id, &envelope)?;
        write_clock_mark(&tx, &entry.device_id, entry.version)?;
        let revision = bump_revision(&tx)?;
        tx.commit()?;

        state.revision = revision;
        state.snapshot.insert(entry.clone());
        Ok(())
    }

    fn commit_folder(&self, state: &mut StoreState, folder: &Folder) -> Result<()> {
        let envelope = self.seal(folder)?;

        let tx = state.db.conn_mut().transaction()?;
        write_folder_row(&tx, folder.id, &envelope)?;
        write_clock_mark(&tx, &folder.device_id, folder.version)?;
        let revision = bump_revision(&tx)?;
        tx.commit()?;

        state.revision = revision;
        state.snapshot.clock.observe(&folder.device_id, folder.version);
        state.snapshot.folders.insert(folder.id, folder.clone());
        Ok(())
    }

    /// Write only the rows that differ from the current state, then swap the
    /// in-memory snapshot.
    fn replace_state(&self, state: &mut StoreState, snapshot: VaultSnapshot) -> Result<u64> {
        let mut sealed_entries = Vec::new();
        for (id, entry) in &snapshot.entries {
            if state.snapshot.entries.get(id) != Some(entry) {
                sealed_entries.push((*id, self.seal(entry)?));
            }
        }
        let mut sealed_folders = Vec::new();
        for (id, folder) in &snapshot.folders {
            if state.snapshot.folders.get(id) != Some(folder) {
                sealed_folders.push((*id, self.seal(folder)?));
            }
        }
        let removed_entries: Vec<Uuid> = state
            .snapshot
            .entries
            .keys()
            .filter(|id| !snapshot.entries.contains_key(id))
            .copied()
            .collect();
        let removed_folders: Vec<Uuid> = state
            .snapshot
            .folders
            .keys()
            .filter(|id| !snapshot.folders.contains_key(id))
            .copied()
            .collect();

        let tx = state.db.conn_mut().transaction()?;
        for (id, envelope) in &sealed_entries {
            write_entry_row(&tx, *id, envelope)?;
        }
        for (id, envelope) in &sealed_folders {
            write_folder_row(&tx, *id, envelope)?;
        }
        for id in &removed_entries {
            tx.execute("DELETE FROM entries WHERE entry_id = ?1", [id.to_string()])?;
        }
        for id in &removed_folders {
            tx.execute("DELETE FROM folders WHERE folder_id = ?1", [id.to_string()])?;
        }

        tx.execute("DELETE FROM clock_map", [])?;
        for (device, version) in snapshot.clock.iter() {
            write_clock_mark(&tx, device, *version)?;
        }
        tx.execute("DELETE FROM device_acks", [])?;
        for (device, clock) in &snapshot.acks {
            tx.execute(
                "INSERT INTO device_acks (device_id, clock) VALUES (?1, ?2)",
                params![device, serde_json::to_string(clock)?],
            )?;
        }
        let revision = bump_revision(&tx)?;
        tx.commit()?;

        debug!(
            written = sealed_entries.len(),
            removed = removed_entries.len(),
            revision,
            "Applied merged snapshot"
        );

        state.revision = revision;
        state.snapshot = snapshot;
        Ok(revision)
    }
}

fn vault_exists(db: &Database) -> Result<bool> {
    Ok(db
        .conn()
        .query_row("SELECT EXISTS(SELECT 1 FROM vault_metadata WHERE id = 1)", [], |row| {
            row.get(0)
        })?)
}

fn write_vault_metadata(
    db: &Database,
    device_id: &str,
    key_material: Option<(&KdfParams, &WrappedKey)>,
) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(StoreError::InvalidInput("device id must not be empty".to_string()));
    }
    let (kdf_params, wrapped_key) = match key_material {
        Some((params, wrapped)) => (
            Some(serde_json::to_vec(params)?),
            Some(serde_json::to_vec(wrapped)?),
        ),
        None => (None, None),
    };
    let now = Utc::now().timestamp();
    db.conn().execute(
        "INSERT INTO vault_metadata (id, version, device_id, kdf_params, wrapped_key,
                                     revision, created_at, last_modified)
         VALUES (1, ?1, ?2, ?3, ?4, 0, ?5, ?5)",
        params![CURRENT_SCHEMA_VERSION, device_id, kdf_params, wrapped_key, now],
    )?;
    Ok(())
}

fn read_key_material(db: &Database) -> Result<(KdfParams, WrappedKey)> {
    let row: Option<(Option<Vec<u8>>, Option<Vec<u8>>)> = db
        .conn()
        .query_row(
            "SELECT kdf_params, wrapped_key FROM vault_metadata WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((Some(params), Some(wrapped))) => {
            Ok((serde_json::from_slice(&params)?, serde_json::from_slice(&wrapped)?))
        }
        Some(_) => Err(StoreError::InvalidInput(
            "vault is not passphrase protected".to_string(),
        )),
        None => Err(DatabaseError::MetadataMissing.into()),
    }
}

fn open_record<T: DeserializeOwned>(
    envelope: &[u8],
    key: &crate::crypto::SubKey,
    row_id: &str,
) -> Result<T> {
    let plaintext = open_from_bytes(envelope, key)
        .map_err(|e| StoreError::StorageCorrupt(format!("record {}: {}", row_id, e)))?;
    serde_json::from_slice(plaintext.as_bytes())
        .map_err(|e| StoreError::StorageCorrupt(format!("record {}: {}", row_id, e)))
}

fn write_entry_row(tx: &Transaction<'_>, id: Uuid, envelope: &[u8]) -> Result<()> {
    tx.execute(
        "INSERT INTO entries (entry_id, envelope) VALUES (?1, ?2)
         ON CONFLICT(entry_id) DO UPDATE SET envelope = excluded.envelope",
        params![id.to_string(), envelope],
    )?;
    Ok(())
}

fn write_folder_row(tx: &Transaction<'_>, id: Uuid, envelope: &[u8]) -> Result<()> {
    tx.execute(
        "INSERT INTO folders (folder_id, envelope) VALUES (?1, ?2)
         ON CONFLICT(folder_id) DO UPDATE SET envelope = excluded.envelope",
        params![id.to_string(), envelope],
    )?;
    Ok(())
}

fn write_clock_mark(tx: &Transaction<'_>, device: &str, version: u64) -> Result<()> {
    tx.execute(
        "INSERT INTO clock_map (device_id, version) VALUES (?1, ?2)
         ON CONFLICT(device_id) DO UPDATE SET version = MAX(version, excluded.version)",
        params![device, version as i64],
    )?;
    Ok(())
}

fn bump_revision(tx: &Transaction<'_>) -> Result<u64> {
    tx.execute(
        "UPDATE vault_metadata SET revision = revision + 1, last_modified = ?1 WHERE id = 1",
        [Utc::now().timestamp()],
    )?;
    let revision: i64 =
        tx.query_row("SELECT revision FROM vault_metadata WHERE id = 1", [], |row| {
            row.get(0)
        })?;
    Ok(revision as u64)
}

/// Logical timestamp: wall clock, but never behind the last one this device
/// issued or the entry's previous timestamp.
fn next_timestamp(state: &mut StoreState, previous: i64) -> i64 {
    let now = Utc::now()
        .timestamp_millis()
        .max(state.last_timestamp + 1)
        .max(previous + 1);
    state.last_timestamp = now;
    now
}

fn live_entry(snapshot: &VaultSnapshot, id: Uuid) -> Result<&VaultEntry> {
    match snapshot.entries.get(&id) {
        Some(entry) if entry.tombstone => Err(StoreError::Tombstoned(id)),
        Some(entry) => Ok(entry),
        None => Err(StoreError::NotFound(id)),
    }
}

fn live_folder(snapshot: &VaultSnapshot, id: Uuid) -> Result<&Folder> {
    match snapshot.folders.get(&id) {
        Some(folder) if !folder.tombstone => Ok(folder),
        _ => Err(StoreError::FolderNotFound(id)),
    }
}

fn check_folder(snapshot: &VaultSnapshot, folder_id: Option<Uuid>) -> Result<()> {
    match folder_id {
        Some(id) => live_folder(snapshot, id).map(|_| ()),
        None => Ok(()),
    }
}

fn check_expected(id: Uuid, current: u64, expected: Option<u64>) -> Result<()> {
    match expected {
        Some(expected) if expected != current => Err(StoreError::VersionConflict {
            entry: Some(id),
            expected,
            found: current,
        }),
        _ => Ok(()),
    }
}

fn validate_folder_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::InvalidInput("folder name must not be empty".to_string()));
    }
    Ok(name.to_string())
}
