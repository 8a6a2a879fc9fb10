use super::*;
use crate::access::{AccessTracker, AccessType};
use crate::crypto::StaticKeyProvider;

fn store(device: &str) -> EntryStore {
    EntryStore::in_memory(device, Box::new(StaticKeyProvider::new([7u8; 32]))).unwrap()
}

fn login(user: &str, password: &str) -> EntryDraft {
    EntryDraft::new(EntryKind::Login)
        .field("username", user)
        .field("password", password)
}

fn temp_vault_path() -> std::path::PathBuf {
    std::env::temp_dir()
        .join(format!("vaultsync-store-{}", Uuid::new_v4()))
        .join("vault.db")
}

#[test]
fn create_assigns_first_version() {
    let store = store("dev-a");
    let entry = store.create(login("alice", "pw1")).unwrap();

    assert_eq!(entry.version, 1);
    assert_eq!(entry.device_id, "dev-a");
    assert!(!entry.tombstone);
    assert_eq!(entry.created_at, entry.updated_at);

    let fetched = store.get(entry.id).unwrap();
    assert_eq!(fetched, entry);
}

#[test]
fn create_requires_kind() {
    let store = store("dev-a");
    let draft = EntryDraft::default().field("username", "alice");
    assert!(matches!(store.create(draft), Err(StoreError::InvalidInput(_))));
}

#[test]
fn versions_increase_per_device() {
    let store = store("dev-a");
    let a = store.create(login("a", "1")).unwrap();
    let b = store.create(login("b", "2")).unwrap();
    assert!(b.version > a.version);

    let (snapshot, _) = store.snapshot().unwrap();
    assert_eq!(snapshot.clock.get("dev-a"), b.version);
}

#[test]
fn update_bumps_version_and_timestamp() {
    let store = store("dev-a");
    let entry = store.create(login("alice", "pw1")).unwrap();

    let updated = store
        .update(entry.id, login("alice", "pw2"), Some(entry.version))
        .unwrap();

    assert!(updated.version > entry.version);
    assert!(updated.updated_at > entry.updated_at);
    assert_eq!(updated.created_at, entry.created_at);
    assert_eq!(updated.field("password"), Some("pw2"));
}

#[test]
fn update_with_stale_version_conflicts() {
    let store = store("dev-a");
    let entry = store.create(login("alice", "pw1")).unwrap();
    store.update(entry.id, login("alice", "pw2"), None).unwrap();

    let result = store.update(entry.id, login("alice", "pw3"), Some(entry.version));
    assert!(matches!(
        result,
        Err(StoreError::VersionConflict { entry: Some(id), .. }) if id == entry.id
    ));
    assert_eq!(store.get(entry.id).unwrap().field("password"), Some("pw2"));
}

#[test]
fn update_missing_entry_not_found() {
    let store = store("dev-a");
    let id = Uuid::new_v4();
    assert!(matches!(
        store.update(id, login("a", "b"), None),
        Err(StoreError::NotFound(missing)) if missing == id
    ));
}

#[test]
fn delete_tombstones_and_clears_content() {
    let store = store("dev-a");
    let entry = store
        .create(login("alice", "pw1").tag("work"))
        .unwrap();

    let tombstone = store.delete(entry.id, None).unwrap();
    assert!(tombstone.tombstone);
    assert!(tombstone.fields.is_empty());
    assert!(tombstone.tags.is_empty());
    assert_eq!(tombstone.id, entry.id);
    assert_eq!(tombstone.created_at, entry.created_at);
    assert!(tombstone.version > entry.version);

    assert!(matches!(store.get(entry.id), Err(StoreError::NotFound(_))));
    assert!(store.get_any(entry.id).unwrap().tombstone);
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn update_after_delete_is_rejected() {
    let store = store("dev-a");
    let entry = store.create(login("alice", "pw1")).unwrap();
    store.delete(entry.id, None).unwrap();

    assert!(matches!(
        store.update(entry.id, login("alice", "pw2"), None),
        Err(StoreError::Tombstoned(_))
    ));
}

#[test]
fn undelete_requires_tombstone_and_bumps_version() {
    let store = store("dev-a");
    let entry = store.create(login("alice", "pw1")).unwrap();

    assert!(matches!(
        store.undelete(entry.id, login("alice", "pw1")),
        Err(StoreError::InvalidInput(_))
    ));

    let tombstone = store.delete(entry.id, None).unwrap();
    let restored = store.undelete(entry.id, login("alice", "restored")).unwrap();

    assert!(!restored.tombstone);
    assert!(restored.version > tombstone.version);
    assert_eq!(restored.field("password"), Some("restored"));
}

#[test]
fn list_filters_by_folder_and_tag() {
    let store = store("dev-a");
    let folder = store.create_folder("Work").unwrap();

    let in_folder = store
        .create(login("alice", "pw").in_folder(folder.id))
        .unwrap();
    let tagged = store.create(login("bob", "pw").tag("shared")).unwrap();
    store.create(EntryDraft::new(EntryKind::Note).field("body", "hi")).unwrap();

    assert_eq!(store.list().unwrap().len(), 3);

    let listed = store.list_in_folder(folder.id).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, in_folder.id);

    let listed = store.list_tagged("shared").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, tagged.id);
}

#[test]
fn entries_cannot_point_at_missing_folders() {
    let store = store("dev-a");
    let result = store.create(login("alice", "pw").in_folder(Uuid::new_v4()));
    assert!(matches!(result, Err(StoreError::FolderNotFound(_))));
}

#[test]
fn folder_lifecycle() {
    let store = store("dev-a");
    let folder = store.create_folder("  Personal ").unwrap();
    assert_eq!(folder.name, "Personal");

    let renamed = store.rename_folder(folder.id, "Home").unwrap();
    assert_eq!(renamed.name, "Home");
    assert!(renamed.version > folder.version);

    let entry = store.create(login("a", "b").in_folder(folder.id)).unwrap();
    store.delete_folder(folder.id).unwrap();

    assert!(store.list_folders().unwrap().is_empty());
    // Membership is a weak reference; the entry survives.
    assert_eq!(store.get(entry.id).unwrap().folder_id, Some(folder.id));
    assert!(matches!(
        store.rename_folder(folder.id, "Again"),
        Err(StoreError::FolderNotFound(_))
    ));
    assert!(matches!(store.create_folder("   "), Err(StoreError::InvalidInput(_))));
}

#[test]
fn every_mutation_bumps_revision() {
    let store = store("dev-a");
    let r0 = store.revision().unwrap();
    let entry = store.create(login("a", "b")).unwrap();
    let r1 = store.revision().unwrap();
    store.delete(entry.id, None).unwrap();
    let r2 = store.revision().unwrap();

    assert!(r0 < r1 && r1 < r2);
}

#[test]
fn apply_merged_replaces_state() {
    let store = store("dev-a");
    let keep = store.create(login("keep", "1")).unwrap();
    let drop_me = store.create(login("drop", "2")).unwrap();

    let (mut snapshot, revision) = store.snapshot().unwrap();
    snapshot.entries.remove(&drop_me.id);
    let mut remote = keep.clone();
    remote.id = Uuid::new_v4();
    remote.device_id = "dev-b".to_string();
    remote.version = 4;
    snapshot.insert(remote.clone());

    let new_revision = store.apply_merged_at(snapshot, revision).unwrap();
    assert!(new_revision > revision);

    assert!(store.get(keep.id).is_ok());
    assert!(matches!(store.get_any(drop_me.id), Err(StoreError::NotFound(_))));
    assert_eq!(store.get(remote.id).unwrap().device_id, "dev-b");
    assert_eq!(store.snapshot().unwrap().0.clock.get("dev-b"), 4);
}

#[test]
fn apply_merged_at_rejects_stale_base() {
    let store = store("dev-a");
    let (snapshot, revision) = store.snapshot().unwrap();
    let entry = store.create(login("late", "edit")).unwrap();

    let result = store.apply_merged_at(snapshot, revision);
    assert!(matches!(
        result,
        Err(StoreError::VersionConflict { entry: None, .. })
    ));
    // The local edit survived.
    assert!(store.get(entry.id).is_ok());
}

#[test]
fn local_writes_after_merge_outrank_merged_clock() {
    let store = store("dev-a");
    let (mut snapshot, revision) = store.snapshot().unwrap();
    snapshot.clock.observe("dev-a", 41);
    store.apply_merged_at(snapshot, revision).unwrap();

    let entry = store.create(login("a", "b")).unwrap();
    assert_eq!(entry.version, 42);
}

#[test]
fn record_ack_stores_current_clock() {
    let store = store("dev-a");
    store.create(login("a", "b")).unwrap();
    store.record_ack().unwrap();

    let (snapshot, _) = store.snapshot().unwrap();
    assert_eq!(snapshot.acks.get("dev-a"), Some(&snapshot.clock));
}

#[test]
fn purge_requires_retention_and_acks() {
    let store = store("dev-a");
    let entry = store.create(login("a", "b")).unwrap();
    let tombstone = store.delete(entry.id, None).unwrap();
    let day = Duration::from_secs(86_400);

    // Inside the retention window.
    assert!(store
        .purge_tombstones(tombstone.updated_at + 1000, day)
        .unwrap()
        .is_empty());

    // A known device that has not seen the tombstone blocks the purge.
    let (mut snapshot, revision) = store.snapshot().unwrap();
    snapshot
        .acks
        .insert("dev-b".to_string(), ClockMap::from([("dev-a", entry.version)]));
    store.apply_merged_at(snapshot, revision).unwrap();

    let later = tombstone.updated_at + 2 * 86_400_000;
    assert!(store.purge_tombstones(later, day).unwrap().is_empty());

    // Once every device acknowledged it, the tombstone goes away.
    let (mut snapshot, revision) = store.snapshot().unwrap();
    snapshot.acks.insert(
        "dev-b".to_string(),
        ClockMap::from([("dev-a", tombstone.version)]),
    );
    store.apply_merged_at(snapshot, revision).unwrap();

    assert_eq!(store.purge_tombstones(later, day).unwrap(), vec![entry.id]);
    assert!(matches!(store.get_any(entry.id), Err(StoreError::NotFound(_))));
}

#[test]
fn access_records_reads() {
    let tracker = Arc::new(AccessTracker::in_memory());
    let store = store("dev-a").with_access_tracker(tracker.clone());
    let entry = store.create(login("alice", "pw")).unwrap();

    let read = store.access(entry.id, "cli", AccessType::Copy).unwrap();
    assert_eq!(read.field("password"), Some("pw"));

    let log = tracker.entries().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].entry_id, entry.id);
    assert_eq!(log[0].access_type, AccessType::Copy);
}

#[test]
fn sync_metadata_roundtrip() {
    let store = store("dev-a");
    assert_eq!(store.sync_metadata().unwrap(), SyncMetadata::default());

    let metadata = SyncMetadata {
        blob_id: Some("vault".to_string()),
        remote_revision: Some("rev-1".to_string()),
        last_sync_at: Some(5),
        last_conflict_count: 1,
    };
    store.save_sync_metadata(&metadata).unwrap();
    assert_eq!(store.sync_metadata().unwrap(), metadata);
}

#[test]
fn file_vault_persists_across_reopen() {
    let path = temp_vault_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();

    let id = {
        let store =
            EntryStore::create_vault(&path, "dev-a", b"correct horse", KdfParams::minimum()).unwrap();
        let folder = store.create_folder("Work").unwrap();
        let entry = store
            .create(login("alice", "pw1").in_folder(folder.id))
            .unwrap();
        store.record_ack().unwrap();
        entry.id
    };

    let reopened = EntryStore::open(&path, b"correct horse").unwrap();
    assert_eq!(reopened.device_id(), "dev-a");
    let entry = reopened.get(id).unwrap();
    assert_eq!(entry.field("password"), Some("pw1"));
    assert_eq!(reopened.list_folders().unwrap().len(), 1);
    assert_eq!(reopened.snapshot().unwrap().0.clock.get("dev-a"), 2);

    // Next write continues the device's version sequence.
    let updated = reopened.update(id, login("alice", "pw2"), None).unwrap();
    assert_eq!(updated.version, 3);

    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn wrong_passphrase_is_rejected() {
    let path = temp_vault_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    EntryStore::create_vault(&path, "dev-a", b"right", KdfParams::minimum()).unwrap();

    assert!(matches!(
        EntryStore::open(&path, b"wrong"),
        Err(StoreError::Crypto(CryptoError::AuthenticationFailed))
    ));

    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn creating_twice_fails() {
    let path = temp_vault_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    EntryStore::create_vault(&path, "dev-a", b"pw", KdfParams::minimum()).unwrap();

    assert!(matches!(
        EntryStore::create_vault(&path, "dev-a", b"pw", KdfParams::minimum()),
        Err(StoreError::InvalidInput(_))
    ));

    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn tampered_record_is_storage_corrupt() {
    let path = temp_vault_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let key = [9u8; 32];

    {
        let db = Database::open(&path).unwrap();
        let store =
            EntryStore::create_with_provider(db, "dev-a", Box::new(StaticKeyProvider::new(key)))
                .unwrap();
        store.create(login("alice", "pw")).unwrap();
    }

    {
        // Same shape, sealed under a different key.
        let foreign = seal_to_bytes(b"{}", &crate::crypto::SubKey::from_bytes([1u8; 32])).unwrap();
        let db = Database::open(&path).unwrap();
        db.conn()
            .execute("UPDATE entries SET envelope = ?1", [foreign])
            .unwrap();
    }

    let db = Database::open(&path).unwrap();
    let result = EntryStore::open_with_provider(db, Box::new(StaticKeyProvider::new(key)));
    assert!(matches!(result, Err(StoreError::StorageCorrupt(_))));

    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}
