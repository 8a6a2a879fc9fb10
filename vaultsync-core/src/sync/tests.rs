use super::*;
use crate::audit::{AuditEventType, AuditLogger};
use crate::crypto::{StaticKeyProvider, VaultKey};
use crate::merge::{ConflictKind, MergeStrategy, Resolution};
use crate::store::{EntryDraft, EntryKind, EntryStore, VaultSnapshot};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const KEY: [u8; 32] = [42u8; 32];

fn store(device: &str) -> Arc<EntryStore> {
    Arc::new(EntryStore::in_memory(device, Box::new(StaticKeyProvider::new(KEY))).unwrap())
}

fn login(user: &str, password: &str) -> EntryDraft {
    EntryDraft::new(EntryKind::Login)
        .field("username", user)
        .field("password", password)
}

fn options() -> SyncOptions {
    SyncOptions {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        },
        network_timeout: Duration::from_secs(5),
        ..SyncOptions::default()
    }
}

fn engine(store: &Arc<EntryStore>, transport: &Arc<MemoryTransport>) -> SyncEngine {
    SyncEngine::new(store.clone(), transport.clone(), options())
}

fn temp_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir()
        .join(format!("vaultsync_test_{}", name))
        .join(Uuid::new_v4().to_string())
}

#[tokio::test]
async fn first_sync_publishes_local_state() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    let entry = a.create(login("alice", "pw")).unwrap();
    let engine = engine(&a, &transport);

    let report = engine.sync().await.unwrap();
    assert!(report.uploaded);
    assert!(report.local_changed);
    assert!(report.conflicts.is_empty());
    assert_eq!(report.entry_count, 1);
    assert_eq!(report.attempts, 2);
    assert_eq!(report.phase, SyncPhase::Uploading);
    assert_eq!(engine.phase(), SyncPhase::Idle);

    let blob = transport.get("vault").unwrap();
    let remote = crypto::open_snapshot(&blob.bytes, &VaultKey::from_bytes(KEY)).unwrap();
    assert_eq!(remote.entries[&entry.id], entry);
    assert_eq!(remote.acks["dev-a"], remote.clock);

    let metadata = a.sync_metadata().unwrap();
    assert_eq!(metadata.blob_id.as_deref(), Some("vault"));
    assert_eq!(metadata.remote_revision, Some(blob.revision));
    assert!(metadata.last_sync_at.is_some());
}

#[tokio::test]
async fn second_sync_without_changes_does_nothing() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    a.create(login("alice", "pw")).unwrap();
    let engine = engine(&a, &transport);

    engine.sync().await.unwrap();
    let revision = a.revision().unwrap();

    let report = engine.sync().await.unwrap();
    assert!(!report.uploaded);
    assert!(!report.local_changed);
    assert_eq!(report.phase, SyncPhase::Merging);
    assert_eq!(transport.upload_count(), 1);
    assert_eq!(a.revision().unwrap(), revision);
}

#[tokio::test]
async fn two_devices_converge() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    let b = store("dev-b");
    let sync_a = engine(&a, &transport);
    let sync_b = engine(&b, &transport);

    let entry = a.create(login("alice", "pw1")).unwrap();
    sync_a.sync().await.unwrap();
    let report = sync_b.sync().await.unwrap();
    assert!(report.local_changed);
    assert_eq!(b.get(entry.id).unwrap(), entry);

    let edited = b
        .update(entry.id, login("alice", "pw2"), Some(entry.version))
        .unwrap();
    sync_b.sync().await.unwrap();
    let report = sync_a.sync().await.unwrap();
    assert!(report.conflicts.is_empty());
    assert_eq!(a.get(entry.id).unwrap(), edited);

    // Both sides have seen everything; nothing left to publish.
    assert!(!sync_a.sync().await.unwrap().uploaded);
    assert!(!sync_b.sync().await.unwrap().uploaded);
    assert_eq!(a.list().unwrap(), b.list().unwrap());
}

#[tokio::test]
async fn concurrent_edits_to_different_fields_merge() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    let b = store("dev-b");
    let sync_a = engine(&a, &transport);
    let sync_b = engine(&b, &transport);

    let entry = a.create(login("alice", "pw")).unwrap();
    sync_a.sync().await.unwrap();
    sync_b.sync().await.unwrap();

    a.update(
        entry.id,
        login("alice", "pw").field("url", "https://example.com"),
        None,
    )
    .unwrap();
    b.update(entry.id, login("alice", "pw").field("notes", "shared"), None)
        .unwrap();

    sync_a.sync().await.unwrap();
    let report = sync_b.sync().await.unwrap();
    assert!(report.conflicts.is_empty());
    sync_a.sync().await.unwrap();

    for store in [&a, &b] {
        let merged = store.get(entry.id).unwrap();
        assert_eq!(merged.field("url"), Some("https://example.com"));
        assert_eq!(merged.field("notes"), Some("shared"));
        assert_eq!(merged.field("password"), Some("pw"));
    }
}

#[tokio::test]
async fn merged_entry_survives_an_edit_made_before_it_arrived() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    let b = store("dev-b");
    let sync_a = engine(&a, &transport);
    let sync_b = engine(&b, &transport);

    let entry = a.create(login("alice", "pw")).unwrap();
    sync_a.sync().await.unwrap();
    sync_b.sync().await.unwrap();

    a.update(
        entry.id,
        login("alice", "pw").field("url", "https://example.com"),
        None,
    )
    .unwrap();
    b.update(entry.id, login("alice", "pw").field("notes", "shared"), None)
        .unwrap();

    // dev-a merges both edits.
    sync_b.sync().await.unwrap();
    let report = sync_a.sync().await.unwrap();
    assert!(report.conflicts.is_empty());
    let merged = a.get(entry.id).unwrap();
    assert_eq!(merged.device_id, "dev-a");
    assert_eq!(merged.field("url"), Some("https://example.com"));

    // dev-b edits again before pulling the merge.
    b.update(
        entry.id,
        login("alice", "pw")
            .field("notes", "shared")
            .field("pin", "1234"),
        None,
    )
    .unwrap();

    let report = sync_b.sync().await.unwrap();
    assert!(report.conflicts.is_empty());
    sync_a.sync().await.unwrap();

    for store in [&a, &b] {
        let current = store.get(entry.id).unwrap();
        assert_eq!(current.field("url"), Some("https://example.com"));
        assert_eq!(current.field("notes"), Some("shared"));
        assert_eq!(current.field("pin"), Some("1234"));
    }
    assert_eq!(a.get(entry.id).unwrap(), b.get(entry.id).unwrap());
}

#[tokio::test]
async fn delete_beats_concurrent_edit() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    let b = store("dev-b");
    let sync_a = engine(&a, &transport);
    let sync_b = engine(&b, &transport);

    let entry = a.create(login("alice", "pw")).unwrap();
    sync_a.sync().await.unwrap();
    sync_b.sync().await.unwrap();

    a.delete(entry.id, None).unwrap();
    b.update(entry.id, login("alice", "pw2"), None).unwrap();

    sync_a.sync().await.unwrap();
    let report = sync_b.sync().await.unwrap();

    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::TombstoneRace);
    // The losing edit is kept in the record.
    assert_eq!(
        conflict.local.as_ref().unwrap().field("password"),
        Some("pw2")
    );
    assert!(b.get(entry.id).is_err());
    assert!(b.get_any(entry.id).unwrap().tombstone);

    sync_a.sync().await.unwrap();
    assert!(a.get_any(entry.id).unwrap().tombstone);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    a.create(login("alice", "pw")).unwrap();
    let engine = engine(&a, &transport);

    transport.fail_next(2);
    let report = engine.sync().await.unwrap();

    assert!(report.uploaded);
    assert_eq!(report.attempts, 4);
    assert_eq!(transport.download_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_local_state_alone() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    a.create(login("alice", "pw")).unwrap();
    let revision = a.revision().unwrap();
    let engine = engine(&a, &transport);

    transport.fail_next(100);
    let err = engine.sync().await.unwrap_err();

    assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));
    assert!(err.is_retryable());
    assert!(matches!(engine.phase(), SyncPhase::Failed(_)));
    assert_eq!(a.revision().unwrap(), revision);
    assert_eq!(transport.upload_count(), 0);
    assert!(a.sync_metadata().unwrap().last_sync_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_transport_times_out() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    let engine = engine(&a, &transport);

    transport.set_delay(Some(Duration::from_secs(60)));
    let err = engine.sync().await.unwrap_err();

    assert!(matches!(
        err,
        SyncError::RetriesExhausted {
            last: TransportError::Timeout(_),
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn cancelled_fetch_leaves_local_state_alone() {
    let transport = Arc::new(MemoryTransport::new());
    let b = store("dev-b");
    b.create(login("bob", "pw")).unwrap();
    engine(&b, &transport).sync().await.unwrap();

    let a = store("dev-a");
    a.create(login("alice", "pw")).unwrap();
    let revision = a.revision().unwrap();
    let (before, _) = a.snapshot().unwrap();
    let engine = engine(&a, &transport);

    transport.set_delay(Some(Duration::from_secs(1)));
    let cancelled = tokio::time::timeout(Duration::from_millis(500), engine.sync()).await;
    assert!(cancelled.is_err());

    assert_eq!(a.revision().unwrap(), revision);
    assert_eq!(a.snapshot().unwrap().0, before);
    assert_eq!(a.list().unwrap().len(), 1);
    assert_eq!(engine.phase(), SyncPhase::Idle);

    // The engine is usable again afterwards.
    transport.set_delay(None);
    let report = engine.sync().await.unwrap();
    assert!(report.local_changed);
    assert_eq!(a.list().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelled_upload_publishes_nothing() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    let entry = a.create(login("alice", "pw")).unwrap();
    let engine = engine(&a, &transport);

    // The download finishes after one second; the upload would after two.
    transport.set_delay(Some(Duration::from_secs(1)));
    let cancelled = tokio::time::timeout(Duration::from_millis(1500), engine.sync()).await;
    assert!(cancelled.is_err());

    assert!(transport.get("vault").is_none());
    assert!(a.sync_metadata().unwrap().last_sync_at.is_none());
    assert_eq!(engine.phase(), SyncPhase::Idle);
    // Whatever was persisted before the upload is a complete merge.
    assert_eq!(a.get(entry.id).unwrap(), entry);
    let revision = a.revision().unwrap();

    transport.set_delay(None);
    let report = engine.sync().await.unwrap();
    assert!(report.uploaded);
    assert!(!report.local_changed);
    assert_eq!(a.revision().unwrap(), revision);
}

#[tokio::test]
async fn lost_upload_race_restarts_from_fetch() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    a.create(login("alice", "pw")).unwrap();
    let engine = engine(&a, &transport);

    transport.conflict_next(1);
    let report = engine.sync().await.unwrap();

    assert!(report.uploaded);
    assert_eq!(report.restarts, 1);
    assert_eq!(report.attempts, 4);
    assert_eq!(transport.download_count(), 2);
}

#[tokio::test]
async fn restarts_are_bounded() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    a.create(login("alice", "pw")).unwrap();
    let engine = SyncEngine::new(
        a.clone(),
        transport.clone(),
        SyncOptions {
            max_restarts: 2,
            ..options()
        },
    );

    transport.conflict_next(10);
    let err = engine.sync().await.unwrap_err();

    assert!(matches!(err, SyncError::VersionConflict { .. }));
    assert_eq!(transport.upload_count(), 3);
}

#[tokio::test]
async fn foreign_key_blob_is_rejected_without_touching_local() {
    let transport = Arc::new(MemoryTransport::new());
    let sealed =
        crypto::seal_snapshot(&VaultSnapshot::new(), &VaultKey::from_bytes([9u8; 32])).unwrap();
    transport.put("vault", sealed);

    let a = store("dev-a");
    a.create(login("alice", "pw")).unwrap();
    let revision = a.revision().unwrap();
    let engine = engine(&a, &transport);

    let err = engine.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::AuthenticationFailure));
    assert!(!err.is_retryable());
    assert_eq!(a.revision().unwrap(), revision);
    assert_eq!(transport.upload_count(), 0);
}

#[tokio::test]
async fn malformed_blob_is_format_error() {
    let transport = Arc::new(MemoryTransport::new());
    transport.put("vault", b"garbage".to_vec());
    let engine = engine(&store("dev-a"), &transport);

    assert!(matches!(
        engine.sync().await.unwrap_err(),
        SyncError::Format(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn concurrent_sync_is_rejected() {
    let transport = Arc::new(MemoryTransport::new());
    let engine = engine(&store("dev-a"), &transport);
    transport.set_delay(Some(Duration::from_secs(1)));

    let (first, second) = tokio::join!(engine.sync(), async {
        tokio::task::yield_now().await;
        engine.sync().await
    });

    assert!(first.is_ok());
    assert!(matches!(second, Err(SyncError::AlreadySyncing)));
}

#[tokio::test(start_paused = true)]
async fn requests_during_a_cycle_are_coalesced() {
    let transport = Arc::new(MemoryTransport::new());
    let engine = engine(&store("dev-a"), &transport);
    transport.set_delay(Some(Duration::from_secs(1)));

    let (first, second) = tokio::join!(engine.request_sync(), async {
        tokio::task::yield_now().await;
        engine.request_sync().await
    });

    assert!(matches!(first.unwrap(), SyncOutcome::Completed(_)));
    assert_eq!(second.unwrap(), SyncOutcome::Coalesced);
    // The coalesced request ran as a follow-up cycle.
    assert_eq!(transport.download_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn phase_is_observable_mid_cycle() {
    let transport = Arc::new(MemoryTransport::new());
    let engine = engine(&store("dev-a"), &transport);
    let mut phases = engine.subscribe();
    transport.set_delay(Some(Duration::from_secs(1)));

    let (report, observed) = tokio::join!(engine.sync(), async {
        tokio::task::yield_now().await;
        engine.phase()
    });

    report.unwrap();
    assert_eq!(observed, SyncPhase::Fetching);
    assert!(phases.has_changed().unwrap());
    assert_eq!(*phases.borrow_and_update(), SyncPhase::Idle);
}

#[tokio::test]
async fn manual_conflicts_wait_for_a_decision() {
    let transport = Arc::new(MemoryTransport::new());
    let manual = SyncOptions {
        strategy: MergeStrategy::ManualPrompt,
        ..options()
    };
    let a = store("dev-a");
    let b = store("dev-b");
    let sync_a = SyncEngine::new(a.clone(), transport.clone(), manual.clone());
    let sync_b = SyncEngine::new(b.clone(), transport.clone(), manual);

    let entry = a.create(login("alice", "pw")).unwrap();
    sync_a.sync().await.unwrap();
    sync_b.sync().await.unwrap();

    a.update(entry.id, login("alice", "from-a"), None).unwrap();
    b.update(entry.id, login("alice", "from-b"), None).unwrap();
    sync_a.sync().await.unwrap();

    let report = sync_b.sync().await.unwrap();
    assert_eq!(report.pending().count(), 1);
    assert!(!report.local_changed);
    assert!(!report.uploaded);
    assert_eq!(b.get(entry.id).unwrap().field("password"), Some("from-b"));

    let preview = sync_b.preview().await.unwrap();
    assert_eq!(preview.conflicts.len(), 1);
    assert_eq!(preview.conflicts[0].unresolved_fields, vec!["password"]);

    let report = sync_b
        .resolve_manual([(entry.id, Resolution::KeepRemote)])
        .await
        .unwrap();
    assert!(report.uploaded);
    assert!(report.conflicts.is_empty());
    let resolved = b.get(entry.id).unwrap();
    assert_eq!(resolved.field("password"), Some("from-a"));
    assert_eq!(resolved.device_id, "dev-b");

    // The decision supersedes both edits everywhere.
    let report = sync_a.sync().await.unwrap();
    assert!(report.conflicts.is_empty());
    assert_eq!(a.get(entry.id).unwrap(), resolved);
}

#[tokio::test]
async fn resolving_an_unknown_conflict_fails() {
    let transport = Arc::new(MemoryTransport::new());
    let engine = engine(&store("dev-a"), &transport);

    let err = engine
        .resolve_manual([(Uuid::new_v4(), Resolution::KeepLocal)])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Resolution(_)));
}

#[tokio::test]
async fn preview_writes_nothing() {
    let transport = Arc::new(MemoryTransport::new());
    let a = store("dev-a");
    let b = store("dev-b");
    a.create(login("alice", "pw")).unwrap();
    engine(&a, &transport).sync().await.unwrap();

    b.create(login("bob", "pw")).unwrap();
    let revision = b.revision().unwrap();
    let outcome = engine(&b, &transport).preview().await.unwrap();

    assert_eq!(outcome.merged.live_entries().count(), 2);
    assert_eq!(b.list().unwrap().len(), 1);
    assert_eq!(b.revision().unwrap(), revision);
    assert_eq!(transport.upload_count(), 1);
}

#[tokio::test]
async fn cycles_are_audited() {
    let transport = Arc::new(MemoryTransport::new());
    let audit = Arc::new(AuditLogger::new(&temp_dir("sync_audit")).unwrap());
    let engine = engine(&store("dev-a"), &transport).with_audit(audit.clone());

    engine.sync().await.unwrap();
    transport.put("vault", b"garbage".to_vec());
    engine.sync().await.unwrap_err();

    let entries = audit.get_entries(10).unwrap();
    assert!(matches!(
        entries[0].event_type,
        AuditEventType::SyncFailed { .. }
    ));
    assert!(matches!(
        entries[1].event_type,
        AuditEventType::SyncCompleted { uploaded: true, .. }
    ));
}

#[tokio::test]
async fn directory_transport_carries_a_vault_between_devices() {
    let shared = Arc::new(DirectoryTransport::new(temp_dir("sync_dir")));
    let a = store("dev-a");
    let b = store("dev-b");
    let sync_a = SyncEngine::new(a.clone(), shared.clone(), options());
    let sync_b = SyncEngine::new(b.clone(), shared.clone(), options());

    let entry = a.create(login("alice", "pw")).unwrap();
    sync_a.sync().await.unwrap();
    sync_b.sync().await.unwrap();

    assert_eq!(b.get(entry.id).unwrap(), entry);
}

#[test]
fn upload_conflicts_map_to_version_conflict() {
    let err: SyncError = TransportError::VersionConflict {
        expected: Some("a".to_string()),
        found: Some("b".to_string()),
    }
    .into();
    assert!(matches!(err, SyncError::VersionConflict { .. }));
    assert!(err.is_retryable());

    let err: SyncError = TransportError::Network("reset".to_string()).into();
    assert!(matches!(err, SyncError::Transport(_)));
    assert!(err.is_retryable());

    let err: SyncError = crate::crypto::CryptoError::AuthenticationFailed.into();
    assert!(matches!(err, SyncError::AuthenticationFailure));
    assert!(!err.is_retryable());
}
