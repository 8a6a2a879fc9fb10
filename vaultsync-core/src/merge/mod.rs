//! Snapshot reconciliation.
//!
//! Given a local and a remote [`VaultSnapshot`], [`ConflictResolver::resolve`]
//! produces one merged snapshot plus a record of every conflict where content
//! was discarded or left for the user to decide.
//!
//! # Algorithm
//!
//! For every entry id present on either side:
//!
//! 1. Present on one side only: keep it, unless it is live and the other
//!    side's clock already covers its write (the other side deleted and purged
//!    it), in which case it is dropped and preserved in a `PurgedRemotely`
//!    record.
//! 2. Identical on both sides: keep.
//! 3. Side S dominates the other side's copy X when
//!    `S.clock[X.device_id] >= X.version`. A copy dominated by the other side
//!    loses without a conflict. When each side dominates the other's copy, the
//!    higher `(version, updated_at, device_id, digest)` wins.
//! 4. Neither dominates: a true conflict. Tombstones beat live edits
//!    (`TombstoneRace`); otherwise the configured [`MergeStrategy`] decides.
//!
//! The result depends only on the inputs, never on which side is "local",
//! except under `ManualPrompt`, which keeps the local copy until the user
//! answers.


use crate::store::models::{CausalOrder, ClockMap, Folder, VaultEntry, VaultSnapshot};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// How true conflicts are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// The later edit wins whole.
    LastWriteWins,
    /// Merge field by field; only fields changed on both sides conflict.
    #[default]
    FieldLevelMerge,
    /// Trust the snapshot whose clock strictly dominates, else merge fields.
    VectorClockCausal,
    /// Keep local and ask the user.
    ManualPrompt,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriteWins => "last-write-wins",
            Self::FieldLevelMerge => "field-level-merge",
            Self::VectorClockCausal => "vector-clock-causal",
            Self::ManualPrompt => "manual-prompt",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-write-wins" | "lww" => Ok(Self::LastWriteWins),
            "field-level-merge" | "field" => Ok(Self::FieldLevelMerge),
            "vector-clock-causal" | "causal" => Ok(Self::VectorClockCausal),
            "manual-prompt" | "manual" => Ok(Self::ManualPrompt),
            other => Err(format!("unknown merge strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides edited the entry concurrently.
    ConcurrentEdit,
    /// One side deleted the entry while the other edited it.
    TombstoneRace,
    /// A live entry the other side already deleted and purged.
    PurgedRemotely,
    /// Left for the user; the local copy is kept provisionally.
    ManualPending,
}

/// One conflict, with both inputs preserved for restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entry_id: Uuid,
    pub local_version: Option<u64>,
    pub remote_version: Option<u64>,
    pub strategy: MergeStrategy,
    pub kind: ConflictKind,
    /// The entry that ended up in the merged snapshot, if any.
    pub result: Option<VaultEntry>,
    pub local: Option<VaultEntry>,
    pub remote: Option<VaultEntry>,
    /// Fields whose discarded value was non-empty and differed.
    pub unresolved_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merged: VaultSnapshot,
    /// Sorted by entry id.
    pub conflicts: Vec<ConflictRecord>,
}

/// A user's answer to a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    Custom(VaultEntry),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("No conflict recorded for entry {0}")]
    NoConflict(Uuid),

    #[error("Conflict for entry {entry_id} has no {side} copy")]
    MissingSide { entry_id: Uuid, side: &'static str },

    #[error("Custom entry {found} does not match conflict {expected}")]
    IdMismatch { expected: Uuid, found: Uuid },
}

#[derive(Clone, Copy)]
enum Side {
    Local,
    Remote,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Merge two snapshots.
    pub fn resolve(
        local: &VaultSnapshot,
        remote: &VaultSnapshot,
        strategy: MergeStrategy,
    ) -> MergeOutcome {
        let mut merged = VaultSnapshot {
            schema_version: local.schema_version.max(remote.schema_version),
            clock: local.clock.merge(&remote.clock),
            acks: merge_acks(&local.acks, &remote.acks),
            ..VaultSnapshot::default()
        };
        let mut conflicts = Vec::new();

        let ids: BTreeSet<Uuid> = local
            .entries
            .keys()
            .chain(remote.entries.keys())
            .copied()
            .collect();

        let merger = Merger {
            local,
            remote,
            strategy,
        };

        for id in ids {
            let (entry, record) = match (local.entries.get(&id), remote.entries.get(&id)) {
                (Some(l), None) => merger.one_sided(l, Side::Local),
                (None, Some(r)) => merger.one_sided(r, Side::Remote),
                (Some(l), Some(r)) => merger.both(l, r),
                (None, None) => continue,
            };
            if let Some(entry) = entry {
                merged.entries.insert(id, entry);
            }
            if let Some(record) = record {
                conflicts.push(record);
            }
        }

        let folder_ids: BTreeSet<Uuid> = local
            .folders
            .keys()
            .chain(remote.folders.keys())
            .copied()
            .collect();
        for id in folder_ids {
            let folder = match (local.folders.get(&id), remote.folders.get(&id)) {
                (Some(l), None) => (!purged(l, &remote.clock)).then(|| l.clone()),
                (None, Some(r)) => (!purged(r, &local.clock)).then(|| r.clone()),
                (Some(l), Some(r)) => Some(merge_folder(l, r, local, remote).clone()),
                (None, None) => None,
            };
            if let Some(folder) = folder {
                merged.folders.insert(id, folder);
            }
        }

        debug!(
            entries = merged.entries.len(),
            conflicts = conflicts.len(),
            strategy = %strategy,
            "Resolved snapshots"
        );

        MergeOutcome { merged, conflicts }
    }
}

struct Merger<'a> {
    local: &'a VaultSnapshot,
    remote: &'a VaultSnapshot,
    strategy: MergeStrategy,
}

impl Merger<'_> {
    fn one_sided(
        &self,
        entry: &VaultEntry,
        side: Side,
    ) -> (Option<VaultEntry>, Option<ConflictRecord>) {
        let other_clock = match side {
            Side::Local => &self.remote.clock,
            Side::Remote => &self.local.clock,
        };
        if entry.is_live() && other_clock.covers(&entry.device_id, entry.version) {
            let (local, remote) = match side {
                Side::Local => (Some(entry.clone()), None),
                Side::Remote => (None, Some(entry.clone())),
            };
            let record = ConflictRecord {
                entry_id: entry.id,
                local_version: local.as_ref().map(|e| e.version),
                remote_version: remote.as_ref().map(|e| e.version),
                strategy: self.strategy,
                kind: ConflictKind::PurgedRemotely,
                result: None,
                local,
                remote,
                unresolved_fields: non_empty_fields(entry),
            };
            return (None, Some(record));
        }
        (Some(entry.clone()), None)
    }

    fn both(&self, l: &VaultEntry, r: &VaultEntry) -> (Option<VaultEntry>, Option<ConflictRecord>) {
        if l == r {
            return (Some(l.clone()), None);
        }

        let local_sees_remote = self.local.clock.covers(&r.device_id, r.version);
        let remote_sees_local = self.remote.clock.covers(&l.device_id, l.version);

        match (local_sees_remote, remote_sees_local) {
            (true, false) => (Some(l.clone()), None),
            (false, true) => (Some(r.clone()), None),
            (true, true) => (Some(highest(l, r).clone()), None),
            (false, false) => self.conflict(l, r),
        }
    }

    fn conflict(&self, l: &VaultEntry, r: &VaultEntry) -> (Option<VaultEntry>, Option<ConflictRecord>) {
        match (l.tombstone, r.tombstone) {
            (true, true) => return (Some(highest(l, r).clone()), None),
            (true, false) | (false, true) => {
                let tombstone = if l.tombstone { l } else { r };
                let live = if l.tombstone { r } else { l };
                let record = self.record(
                    l,
                    r,
                    self.strategy,
                    ConflictKind::TombstoneRace,
                    tombstone,
                    non_empty_fields(live),
                );
                return (Some(tombstone.clone()), Some(record));
            }
            (false, false) => {}
        }

        match self.strategy {
            MergeStrategy::LastWriteWins => {
                let (winner, loser) = later(l, r);
                let discarded = discarded_fields(winner, loser);
                let record = self.record(
                    l,
                    r,
                    MergeStrategy::LastWriteWins,
                    ConflictKind::ConcurrentEdit,
                    winner,
                    discarded,
                );
                (Some(winner.clone()), Some(record))
            }
            MergeStrategy::FieldLevelMerge => self.field_merge(l, r, MergeStrategy::FieldLevelMerge),
            MergeStrategy::VectorClockCausal => match self.local.clock.compare(&self.remote.clock) {
                CausalOrder::After => (Some(l.clone()), None),
                CausalOrder::Before => (Some(r.clone()), None),
                CausalOrder::Equal | CausalOrder::Concurrent => {
                    self.field_merge(l, r, MergeStrategy::VectorClockCausal)
                }
            },
            MergeStrategy::ManualPrompt => {
                let record = self.record(
                    l,
                    r,
                    MergeStrategy::ManualPrompt,
                    ConflictKind::ManualPending,
                    l,
                    differing_fields(l, r),
                );
                (Some(l.clone()), Some(record))
            }
        }
    }

    fn field_merge(
        &self,
        l: &VaultEntry,
        r: &VaultEntry,
        strategy: MergeStrategy,
    ) -> (Option<VaultEntry>, Option<ConflictRecord>) {
        let (merged, unresolved) = merge_fields(l, r);
        if unresolved.is_empty() {
            return (Some(merged), None);
        }
        let record = self.record(
            l,
            r,
            strategy,
            ConflictKind::ConcurrentEdit,
            &merged,
            unresolved,
        );
        (Some(merged), Some(record))
    }

    fn record(
        &self,
        l: &VaultEntry,
        r: &VaultEntry,
        strategy: MergeStrategy,
        kind: ConflictKind,
        result: &VaultEntry,
        unresolved_fields: Vec<String>,
    ) -> ConflictRecord {
        ConflictRecord {
            entry_id: l.id,
            local_version: Some(l.version),
            remote_version: Some(r.version),
            strategy,
            kind,
            result: Some(result.clone()),
            local: Some(l.clone()),
            remote: Some(r.clone()),
            unresolved_fields,
        }
    }
}

/// Field-by-field merge of two concurrent live copies.
///
/// Returns the merged entry and the fields where both sides held different
/// non-empty values (the later side's value is kept for those).
fn merge_fields(l: &VaultEntry, r: &VaultEntry) -> (VaultEntry, Vec<String>) {
    let (winner, other) = later(l, r);

    let names: BTreeSet<&String> = winner.fields.keys().chain(other.fields.keys()).collect();
    let mut fields = BTreeMap::new();
    let mut unresolved = Vec::new();

    for name in names {
        let w = winner.fields.get(name);
        let o = other.fields.get(name);
        let value = match (non_empty(w), non_empty(o)) {
            _ if w == o => w.cloned().flatten(),
            (Some(a), Some(b)) if a == b => Some(a.to_string()),
            (Some(_), Some(_)) => {
                unresolved.push(name.clone());
                w.cloned().flatten()
            }
            (Some(_), None) => w.cloned().flatten(),
            (None, Some(_)) => o.cloned().flatten(),
            // Both empty, spelled differently.
            (None, None) => w.or(o).cloned().flatten(),
        };
        fields.insert(name.clone(), value);
    }

    let mut merged = winner.clone();
    merged.fields = fields;
    merged.tags = winner.tags.union(&other.tags).cloned().collect();
    merged.folder_id = winner.folder_id.or(other.folder_id);
    merged.created_at = l.created_at.min(r.created_at);
    merged.updated_at = l.updated_at.max(r.updated_at);
    merged.version = l.version.max(r.version) + 1;
    merged.tombstone = false;

    (merged, unresolved)
}

fn non_empty<'a>(value: Option<&'a Option<String>>) -> Option<&'a str> {
    value
        .and_then(|v| v.as_deref())
        .filter(|v| !v.is_empty())
}

fn non_empty_fields(entry: &VaultEntry) -> Vec<String> {
    entry
        .fields
        .keys()
        .filter(|name| entry.field(name).is_some())
        .cloned()
        .collect()
}

/// Non-empty fields of `loser` whose value the winner does not carry.
fn discarded_fields(winner: &VaultEntry, loser: &VaultEntry) -> Vec<String> {
    loser
        .fields
        .keys()
        .filter(|name| match loser.field(name) {
            Some(value) => winner.field(name) != Some(value),
            None => false,
        })
        .cloned()
        .collect()
}

/// Every field whose non-empty value differs between the two copies.
fn differing_fields(l: &VaultEntry, r: &VaultEntry) -> Vec<String> {
    let names: BTreeSet<&String> = l.fields.keys().chain(r.fields.keys()).collect();
    names
        .into_iter()
        .filter(|name| l.field(name) != r.field(name))
        .cloned()
        .collect()
}

/// Order for picking the later edit: `updated_at`, then device id, then
/// version, then content digest.
fn later<'a>(l: &'a VaultEntry, r: &'a VaultEntry) -> (&'a VaultEntry, &'a VaultEntry) {
    let ord = l
        .updated_at
        .cmp(&r.updated_at)
        .then_with(|| l.device_id.cmp(&r.device_id))
        .then_with(|| l.version.cmp(&r.version))
        .then_with(|| l.digest().cmp(&r.digest()));
    if ord == Ordering::Less {
        (r, l)
    } else {
        (l, r)
    }
}

/// Order for copies that have seen each other: version first.
fn highest<'a>(l: &'a VaultEntry, r: &'a VaultEntry) -> &'a VaultEntry {
    let ord = l
        .version
        .cmp(&r.version)
        .then_with(|| l.updated_at.cmp(&r.updated_at))
        .then_with(|| l.device_id.cmp(&r.device_id))
        .then_with(|| l.digest().cmp(&r.digest()));
    if ord == Ordering::Less {
        r
    } else {
        l
    }
}

fn purged(folder: &Folder, other_clock: &ClockMap) -> bool {
    !folder.tombstone && other_clock.covers(&folder.device_id, folder.version)
}

fn merge_folder<'a>(
    l: &'a Folder,
    r: &'a Folder,
    local: &VaultSnapshot,
    remote: &VaultSnapshot,
) -> &'a Folder {
    if l == r {
        return l;
    }
    let local_sees_remote = local.clock.covers(&r.device_id, r.version);
    let remote_sees_local = remote.clock.covers(&l.device_id, l.version);
    match (local_sees_remote, remote_sees_local) {
        (true, false) => l,
        (false, true) => r,
        (false, false) if l.tombstone != r.tombstone => {
            if l.tombstone {
                l
            } else {
                r
            }
        }
        _ => {
            let ord = l
                .version
                .cmp(&r.version)
                .then_with(|| l.updated_at.cmp(&r.updated_at))
                .then_with(|| l.device_id.cmp(&r.device_id))
                .then_with(|| l.name.cmp(&r.name));
            if ord == Ordering::Less {
                r
            } else {
                l
            }
        }
    }
}

fn merge_acks(
    local: &BTreeMap<String, ClockMap>,
    remote: &BTreeMap<String, ClockMap>,
) -> BTreeMap<String, ClockMap> {
    let mut acks = local.clone();
    for (device, clock) in remote {
        let merged = match acks.get(device) {
            Some(existing) => existing.merge(clock),
            None => clock.clone(),
        };
        acks.insert(device.clone(), merged);
    }
    acks
}

/// Restamp every entry the merge synthesized as a fresh write by `device_id`.
///
/// A merged copy that matches neither input is new content. Left under the
/// name of one of its input writers it would share a `(device, version)` with
/// that device's next edit, and dominance would then treat the edit as having
/// seen it. Taking the next version in `device_id`'s own sequence keeps the
/// two apart.
pub fn adopt_merge_products(
    outcome: &mut MergeOutcome,
    local: &VaultSnapshot,
    remote: &VaultSnapshot,
    device_id: &str,
) {
    let products: Vec<Uuid> = outcome
        .merged
        .entries
        .iter()
        .filter(|&(id, entry)| {
            local.entries.get(id) != Some(entry) && remote.entries.get(id) != Some(entry)
        })
        .map(|(id, _)| *id)
        .collect();

    for id in products {
        let Some(mut entry) = outcome.merged.entries.get(&id).cloned() else {
            continue;
        };
        entry.version = entry
            .version
            .max(outcome.merged.clock.get(device_id) + 1);
        entry.device_id = device_id.to_string();
        debug!(entry_id = %id, version = entry.version, "Adopted merged entry");

        for record in outcome.conflicts.iter_mut().filter(|c| c.entry_id == id) {
            record.result = Some(entry.clone());
        }
        outcome.merged.insert(entry);
    }
}

/// Settle a recorded conflict by the user's choice.
///
/// The chosen copy becomes a fresh write by `device_id`: its version is raised
/// past every copy involved so it supersedes them on every device. The record
/// is removed from `outcome` and the merged snapshot updated in place.
pub fn apply_resolution(
    outcome: &mut MergeOutcome,
    entry_id: Uuid,
    choice: Resolution,
    device_id: &str,
) -> Result<VaultEntry, ResolutionError> {
    let index = outcome
        .conflicts
        .iter()
        .position(|c| c.entry_id == entry_id)
        .ok_or(ResolutionError::NoConflict(entry_id))?;
    let record = &outcome.conflicts[index];

    let mut chosen = match choice {
        Resolution::KeepLocal => record.local.clone().ok_or(ResolutionError::MissingSide {
            entry_id,
            side: "local",
        })?,
        Resolution::KeepRemote => record.remote.clone().ok_or(ResolutionError::MissingSide {
            entry_id,
            side: "remote",
        })?,
        Resolution::Custom(entry) => {
            if entry.id != entry_id {
                return Err(ResolutionError::IdMismatch {
                    expected: entry_id,
                    found: entry.id,
                });
            }
            entry
        }
    };

    let current = outcome.merged.entries.get(&entry_id);
    let copies = [record.local.as_ref(), record.remote.as_ref(), current];
    let top_version = copies.iter().flatten().map(|e| e.version).max().unwrap_or(0);
    let top_updated = copies.iter().flatten().map(|e| e.updated_at).max().unwrap_or(0);

    chosen.version = top_version.max(outcome.merged.clock.get(device_id)) + 1;
    chosen.updated_at = chosen.updated_at.max(top_updated + 1);
    chosen.device_id = device_id.to_string();

    outcome.conflicts.remove(index);
    outcome.merged.insert(chosen.clone());
    Ok(chosen)
}
