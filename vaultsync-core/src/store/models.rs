//! Vault data model: entries, folders, clock maps and snapshots.
//!
//! Everything here is ordered (`BTreeMap`/`BTreeSet`) so that serializing the
//! same snapshot twice yields the same bytes. The conflict resolver and the
//! sync engine rely on that for determinism and for equality checks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroize;

/// Version of the canonical snapshot schema.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Device identifiers are compared lexically when breaking ties.
pub type DeviceId = String;

/// Kind of vault entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Login,
    Note,
    Card,
    Identity,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Note => "note",
            Self::Card => "card",
            Self::Identity => "identity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "login" => Some(Self::Login),
            "note" => Some(Self::Note),
            "card" => Some(Self::Card),
            "identity" => Some(Self::Identity),
            _ => None,
        }
    }
}

/// A single vault record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEntry {
    /// Stable across devices, never reused.
    pub id: Uuid,
    pub kind: EntryKind,
    /// Field name → value. `None` and `Some("")` both count as empty.
    pub fields: BTreeMap<String, Option<String>>,
    /// Weak reference to a [`Folder`].
    pub folder_id: Option<Uuid>,
    pub tags: BTreeSet<String>,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds, monotonic per device.
    pub updated_at: i64,
    /// Device that last wrote this entry.
    pub device_id: DeviceId,
    pub version: u64,
    pub tombstone: bool,
}

impl VaultEntry {
    /// Non-empty value of a field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|v| v.as_deref())
            .filter(|v| !v.is_empty())
    }

    pub fn is_live(&self) -> bool {
        !self.tombstone
    }

    /// SHA-256 over the canonical JSON encoding. Used as the last-resort
    /// deterministic tie-breaker between two copies of an entry.
    pub fn digest(&self) -> [u8; 32] {
        // Serializing a struct of ordered maps and plain values cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        Sha256::digest(&bytes).into()
    }

    /// Clear content for tombstoning, keeping id and timestamps.
    pub(crate) fn clear_content(&mut self) {
        wipe_fields(&mut self.fields);
        self.fields.clear();
        self.tags.clear();
        self.folder_id = None;
    }
}

impl std::fmt::Debug for VaultEntry {
    // Field values are secrets; only names are printed.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("folder_id", &self.folder_id)
            .field("tags", &self.tags)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .field("device_id", &self.device_id)
            .field("version", &self.version)
            .field("tombstone", &self.tombstone)
            .finish()
    }
}

impl Drop for VaultEntry {
    fn drop(&mut self) {
        wipe_fields(&mut self.fields);
    }
}

fn wipe_fields(fields: &mut BTreeMap<String, Option<String>>) {
    for value in fields.values_mut().flatten() {
        value.zeroize();
    }
}

/// Caller-supplied content for creating or replacing an entry.
#[derive(Debug, Clone, Default)]
pub struct EntryDraft {
    pub kind: Option<EntryKind>,
    pub fields: BTreeMap<String, Option<String>>,
    pub folder_id: Option<Uuid>,
    pub tags: BTreeSet<String>,
}

impl EntryDraft {
    pub fn new(kind: EntryKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), Some(value.into()));
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn in_folder(mut self, folder_id: Uuid) -> Self {
        self.folder_id = Some(folder_id);
        self
    }

    /// Draft pre-filled from an existing entry, for edits.
    pub fn from_entry(entry: &VaultEntry) -> Self {
        Self {
            kind: Some(entry.kind),
            fields: entry.fields.clone(),
            folder_id: entry.folder_id,
            tags: entry.tags.clone(),
        }
    }
}

/// A folder. Entries point at folders; folders never list entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
    pub updated_at: i64,
    pub device_id: DeviceId,
    pub version: u64,
    pub tombstone: bool,
}

/// Per-device version high-water marks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClockMap(BTreeMap<DeviceId, u64>);

/// Causal relation between two clock maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Equal,
    /// `self` has seen strictly less than `other`.
    Before,
    /// `self` has seen strictly more than `other`.
    After,
    Concurrent,
}

impl ClockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: &str) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    /// Raise the mark for `device` to at least `version`.
    pub fn observe(&mut self, device: &str, version: u64) {
        let slot = self.0.entry(device.to_string()).or_insert(0);
        if version > *slot {
            *slot = version;
        }
    }

    /// Whether this clock has seen `device`'s write at `version`.
    pub fn covers(&self, device: &str, version: u64) -> bool {
        self.get(device) >= version
    }

    /// Element-wise maximum.
    pub fn merge(&self, other: &ClockMap) -> ClockMap {
        let mut merged = self.clone();
        for (device, version) in &other.0 {
            merged.observe(device, *version);
        }
        merged
    }

    /// `self >= other` element-wise.
    pub fn dominates(&self, other: &ClockMap) -> bool {
        other.0.iter().all(|(device, v)| self.get(device) >= *v)
    }

    pub fn compare(&self, other: &ClockMap) -> CausalOrder {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &u64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, u64); N]> for ClockMap {
    fn from(marks: [(&str, u64); N]) -> Self {
        let mut clock = ClockMap::new();
        for (device, version) in marks {
            clock.observe(device, version);
        }
        clock
    }
}

/// Errors reading the canonical snapshot format.
#[derive(Error, Debug)]
pub enum SnapshotFormatError {
    #[error("invalid snapshot encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported snapshot schema version {0}")]
    UnsupportedSchema(u32),
}

/// Immutable view of a whole vault, as exchanged between devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub schema_version: u32,
    pub entries: BTreeMap<Uuid, VaultEntry>,
    #[serde(default)]
    pub folders: BTreeMap<Uuid, Folder>,
    pub clock: ClockMap,
    /// Last clock each known device published. Drives tombstone purging.
    #[serde(default)]
    pub acks: BTreeMap<DeviceId, ClockMap>,
}

impl Default for VaultSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            entries: BTreeMap::new(),
            folders: BTreeMap::new(),
            clock: ClockMap::new(),
            acks: BTreeMap::new(),
        }
    }
}

impl VaultSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry and raise the clock for its writer.
    pub fn insert(&mut self, entry: VaultEntry) {
        self.clock.observe(&entry.device_id, entry.version);
        self.entries.insert(entry.id, entry);
    }

    pub fn live_entries(&self) -> impl Iterator<Item = &VaultEntry> {
        self.entries.values().filter(|e| e.is_live())
    }

    pub fn to_canonical_json(&self) -> Result<Vec<u8>, SnapshotFormatError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_canonical_json(bytes: &[u8]) -> Result<Self, SnapshotFormatError> {
        #[derive(Deserialize)]
        struct Header {
            schema_version: u32,
        }

        // Check the version before committing to the full layout.
        let header: Header = serde_json::from_slice(bytes)?;
        if header.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(SnapshotFormatError::UnsupportedSchema(header.schema_version));
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}
