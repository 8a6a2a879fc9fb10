//! Sync engine: orchestrates the fetch/decrypt/merge/persist/upload cycle.
//!
//! Nothing local is written before the merge result is persisted in one
//! transaction, so dropping a cycle early leaves the vault untouched. The
//! upload happens only after the merged state is durable locally.

use crate::audit::{AuditEventType, AuditLogger};
use crate::crypto::with_key;
use crate::merge::{
    adopt_merge_products, apply_resolution, ConflictKind, ConflictResolver, MergeOutcome,
    Resolution,
};
use crate::store::{EntryStore, StoreError, VaultSnapshot};
use crate::sync::crypto::{open_snapshot, seal_snapshot};
use crate::sync::models::{SyncOptions, SyncOutcome, SyncPhase, SyncReport};
use crate::sync::transport::{BlobTransport, TransportError};
use crate::sync::{Result, SyncError, SyncMetadata};
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// User decisions for pending conflicts, keyed by entry id.
type Choices = BTreeMap<Uuid, Resolution>;

/// Runs sync cycles for one vault. At most one cycle is in flight at a time.
pub struct SyncEngine {
    store: Arc<EntryStore>,
    transport: Arc<dyn BlobTransport>,
    options: SyncOptions,
    cycle: Mutex<()>,
    /// Set when a request arrived while a cycle was running.
    pending: AtomicBool,
    phase: watch::Sender<SyncPhase>,
    audit: Option<Arc<AuditLogger>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<EntryStore>,
        transport: Arc<dyn BlobTransport>,
        options: SyncOptions,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            store,
            transport,
            options,
            cycle: Mutex::new(()),
            pending: AtomicBool::new(false),
            phase,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase.borrow().clone()
    }

    /// Watch phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Run one cycle now. Fails with `AlreadySyncing` if one is in flight.
    pub async fn sync(&self) -> Result<SyncReport> {
        let guard = self
            .cycle
            .try_lock()
            .map_err(|_| SyncError::AlreadySyncing)?;
        self.pending.store(false, Ordering::Release);
        self.drain(guard, &Choices::new()).await
    }

    /// Run a cycle, or if one is in flight, make sure it runs once more
    /// after it finishes.
    pub async fn request_sync(&self) -> Result<SyncOutcome> {
        match self.cycle.try_lock() {
            Ok(guard) => {
                self.pending.store(false, Ordering::Release);
                let report = self.drain(guard, &Choices::new()).await?;
                Ok(SyncOutcome::Completed(report))
            }
            Err(_) => {
                self.pending.store(true, Ordering::Release);
                debug!("Sync in flight, coalescing request");
                Ok(SyncOutcome::Coalesced)
            }
        }
    }

    /// Settle conflicts by user choice and publish the result.
    ///
    /// Runs a full cycle: the remote is fetched and merged again, each
    /// choice is applied to the fresh merge as a new local write, and the
    /// outcome is persisted and uploaded like any other sync.
    pub async fn resolve_manual(
        &self,
        choices: impl IntoIterator<Item = (Uuid, Resolution)>,
    ) -> Result<SyncReport> {
        let choices: Choices = choices.into_iter().collect();
        let guard = self
            .cycle
            .try_lock()
            .map_err(|_| SyncError::AlreadySyncing)?;
        let report = self.run(&choices).await;
        drop(guard);

        let report = report?;
        for entry_id in choices.keys() {
            info!(entry_id = %entry_id, "Conflict resolved");
            self.audit_event(
                AuditEventType::ConflictResolved {
                    entry_id: *entry_id,
                },
                "",
            );
        }
        Ok(report)
    }

    /// Fetch and merge without writing anything, to show what a sync would
    /// report.
    pub async fn preview(&self) -> Result<MergeOutcome> {
        let _guard = self
            .cycle
            .try_lock()
            .map_err(|_| SyncError::AlreadySyncing)?;
        let mut cancel = CancelGuard::new(&self.phase);
        let mut attempts = 0;
        let result = match self.fetch(&mut attempts).await {
            Ok(fetched) => self.store.snapshot().map_err(SyncError::from).and_then(
                |(local, _)| self.merge(&local, fetched.snapshot.as_ref(), &Choices::new()),
            ),
            Err(e) => Err(e),
        };
        cancel.disarm();
        self.set_phase(SyncPhase::Idle);
        result
    }

    async fn drain(&self, guard: MutexGuard<'_, ()>, choices: &Choices) -> Result<SyncReport> {
        let mut guard = guard;
        loop {
            let mut report = self.run(choices).await?;
            while self.pending.swap(false, Ordering::AcqRel) {
                debug!("Running coalesced sync");
                report = self.run(choices).await?;
            }
            drop(guard);

            // A request may have landed between the last check and the release.
            if !self.pending.load(Ordering::Acquire) {
                return Ok(report);
            }
            match self.cycle.try_lock() {
                Ok(next) => {
                    self.pending.store(false, Ordering::Release);
                    guard = next;
                }
                Err(_) => return Ok(report),
            }
        }
    }

    /// One cycle with bookkeeping: phase, logging, audit trail.
    async fn run(&self, choices: &Choices) -> Result<SyncReport> {
        info!(blob_id = %self.options.blob_id, strategy = %self.options.strategy, "Sync started");

        let mut cancel = CancelGuard::new(&self.phase);
        let result = self.run_cycle(choices).await;
        cancel.disarm();

        match result {
            Ok(report) => {
                self.set_phase(SyncPhase::Idle);
                info!(
                    entries = report.entry_count,
                    conflicts = report.conflicts.len(),
                    local_changed = report.local_changed,
                    uploaded = report.uploaded,
                    attempts = report.attempts,
                    restarts = report.restarts,
                    "Sync completed"
                );
                for conflict in &report.conflicts {
                    self.audit_event(
                        AuditEventType::ConflictDetected {
                            entry_id: conflict.entry_id,
                            kind: conflict.kind,
                        },
                        conflict.strategy.as_str(),
                    );
                }
                self.audit_event(
                    AuditEventType::SyncCompleted {
                        conflicts: report.conflicts.len(),
                        uploaded: report.uploaded,
                    },
                    &self.options.blob_id,
                );
                Ok(report)
            }
            Err(e) => {
                let phase = self.phase();
                error!(phase = %phase, "Sync failed: {}", e);
                self.set_phase(SyncPhase::Failed(e.to_string()));
                self.audit_event(
                    AuditEventType::SyncFailed {
                        reason: e.to_string(),
                    },
                    phase.as_str(),
                );
                Err(e)
            }
        }
    }

    /// Passes until one completes, restarting when the upload loses a race.
    async fn run_cycle(&self, choices: &Choices) -> Result<SyncReport> {
        let mut attempts = 0;
        let mut restarts = 0;
        loop {
            match self.pass(&mut attempts, choices).await {
                Ok(mut report) => {
                    report.attempts = attempts;
                    report.restarts = restarts;
                    self.record_success(&report)?;
                    return Ok(report);
                }
                Err(SyncError::VersionConflict { expected, found })
                    if restarts < self.options.max_restarts =>
                {
                    restarts += 1;
                    warn!(
                        restarts,
                        ?expected,
                        ?found,
                        "Remote changed during sync, starting over"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn pass(&self, attempts: &mut u32, choices: &Choices) -> Result<SyncReport> {
        let fetched = self.fetch(attempts).await?;
        let remote = fetched.snapshot;

        let (outcome, local_changed) = self.merge_and_persist(remote.as_ref(), choices)?;
        let MergeOutcome { merged, conflicts } = outcome;

        let mut report = SyncReport {
            phase: if local_changed {
                SyncPhase::Persisting
            } else {
                SyncPhase::Merging
            },
            entry_count: merged.live_entries().count(),
            conflicts,
            local_changed,
            uploaded: false,
            attempts: 0,
            restarts: 0,
            remote_revision: fetched.revision.clone(),
        };

        if report.pending().next().is_some() {
            info!(
                pending = report.pending().count(),
                "Conflicts need a decision, nothing persisted or published"
            );
            return Ok(report);
        }
        if remote.as_ref() == Some(&merged) {
            debug!("Remote already up to date");
            return Ok(report);
        }

        self.set_phase(SyncPhase::Encrypting);
        let sealed = with_key(self.store.key_provider(), |key| seal_snapshot(&merged, key))?;

        self.set_phase(SyncPhase::Uploading);
        let transport = &*self.transport;
        let blob_id = self.options.blob_id.as_str();
        let expected = fetched.revision.as_deref();
        let revision = self
            .call("upload", attempts, move || {
                transport.upload(blob_id, sealed.clone(), expected)
            })
            .await?;

        debug!(revision = %revision, "Uploaded merged snapshot");
        report.phase = SyncPhase::Uploading;
        report.uploaded = true;
        report.remote_revision = Some(revision);
        Ok(report)
    }

    async fn fetch(&self, attempts: &mut u32) -> Result<Fetched> {
        self.set_phase(SyncPhase::Fetching);
        let transport = &*self.transport;
        let blob_id = self.options.blob_id.as_str();
        let blob = self
            .call("download", attempts, move || transport.download(blob_id))
            .await?;

        let Some(blob) = blob else {
            debug!(blob_id, "Nothing published yet");
            return Ok(Fetched {
                snapshot: None,
                revision: None,
            });
        };

        self.set_phase(SyncPhase::Decrypting);
        let snapshot = with_key(self.store.key_provider(), |key| {
            open_snapshot(&blob.bytes, key)
        })?;
        Ok(Fetched {
            snapshot: Some(snapshot),
            revision: Some(blob.revision),
        })
    }

    /// Merge against the current local state and persist the result,
    /// merging again if a local write lands in between.
    fn merge_and_persist(
        &self,
        remote: Option<&VaultSnapshot>,
        choices: &Choices,
    ) -> Result<(MergeOutcome, bool)> {
        let mut remerges = 0;
        loop {
            let (local, base) = self.store.snapshot()?;
            let outcome = self.merge(&local, remote, choices)?;

            let pending = outcome
                .conflicts
                .iter()
                .any(|c| c.kind == ConflictKind::ManualPending);
            if pending || outcome.merged == local {
                return Ok((outcome, false));
            }

            self.set_phase(SyncPhase::Persisting);
            match self.store.apply_merged_at(outcome.merged.clone(), base) {
                Ok(_) => return Ok((outcome, true)),
                Err(StoreError::VersionConflict { entry: None, .. })
                    if remerges < self.options.max_remerges =>
                {
                    remerges += 1;
                    debug!(remerges, "Local vault changed during merge, merging again");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn merge(
        &self,
        local: &VaultSnapshot,
        remote: Option<&VaultSnapshot>,
        choices: &Choices,
    ) -> Result<MergeOutcome> {
        self.set_phase(SyncPhase::Merging);
        let empty = VaultSnapshot::new();
        let remote = remote.unwrap_or(&empty);

        let mut outcome = ConflictResolver::resolve(local, remote, self.options.strategy);
        if !outcome.merged.clock.dominates(&local.clock)
            || !outcome.merged.clock.dominates(&remote.clock)
        {
            return Err(SyncError::Internal(
                "merged clock does not cover its inputs".to_string(),
            ));
        }

        let device_id = self.store.device_id();
        adopt_merge_products(&mut outcome, local, remote, device_id);
        for (entry_id, choice) in choices {
            apply_resolution(&mut outcome, *entry_id, choice.clone(), device_id)?;
        }

        // Publishing the merge acknowledges everything it contains.
        let clock = outcome.merged.clock.clone();
        outcome.merged.acks.insert(device_id.to_string(), clock);
        Ok(outcome)
    }

    /// Call the transport with a timeout, retrying transient failures with
    /// exponential backoff.
    async fn call<T, F, Fut>(&self, op: &'static str, attempts: &mut u32, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        let policy = self.options.retry;
        let timeout = self.options.network_timeout;
        let mut attempt = 0;

        loop {
            attempt += 1;
            *attempts += 1;

            let err = match tokio::time::timeout(timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout(timeout),
            };

            if !err.is_retryable() {
                return Err(err.into());
            }
            if attempt >= policy.max_attempts {
                return Err(SyncError::RetriesExhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = policy.delay_for(attempt);
            warn!(
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Transport call failed, retrying: {}",
                err
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn record_success(&self, report: &SyncReport) -> Result<()> {
        let metadata = SyncMetadata {
            blob_id: Some(self.options.blob_id.clone()),
            remote_revision: report.remote_revision.clone(),
            last_sync_at: Some(Utc::now().timestamp_millis()),
            last_conflict_count: u32::try_from(report.conflicts.len()).unwrap_or(u32::MAX),
        };
        self.store.save_sync_metadata(&metadata)?;
        Ok(())
    }

    fn set_phase(&self, phase: SyncPhase) {
        debug!(phase = %phase, "Sync phase");
        self.phase.send_replace(phase);
    }

    fn audit_event(&self, event: AuditEventType, context: &str) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log(event, context) {
                warn!("Failed to write audit event: {}", e);
            }
        }
    }
}

struct Fetched {
    snapshot: Option<VaultSnapshot>,
    revision: Option<String>,
}

/// Resets the published phase to `Idle` when a cycle future is dropped
/// before it finishes.
struct CancelGuard<'a> {
    phase: &'a watch::Sender<SyncPhase>,
    armed: bool,
}

impl<'a> CancelGuard<'a> {
    fn new(phase: &'a watch::Sender<SyncPhase>) -> Self {
        Self { phase, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Sync cycle cancelled");
            self.phase.send_replace(SyncPhase::Idle);
        }
    }
}
