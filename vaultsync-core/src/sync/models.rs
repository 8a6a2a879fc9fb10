//! Sync data models: phases, options and reports.

use crate::merge::{ConflictRecord, MergeStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The sealed vault as stored by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBlob {
    pub bytes: Vec<u8>,
    /// Opaque tag that changes whenever the blob does.
    pub revision: String,
}

/// Where a sync cycle currently is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Fetching,
    Decrypting,
    Merging,
    Persisting,
    Encrypting,
    Uploading,
    Failed(String),
}

impl SyncPhase {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Decrypting => "decrypting",
            Self::Merging => "merging",
            Self::Persisting => "persisting",
            Self::Encrypting => "encrypting",
            Self::Uploading => "uploading",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Exponential backoff for transport calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per call, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub blob_id: String,
    pub strategy: MergeStrategy,
    pub retry: RetryPolicy,
    /// How often a cycle may start over after losing an upload race.
    pub max_restarts: u32,
    /// How often the merge may be redone when a local edit lands mid-cycle.
    pub max_remerges: u32,
    pub network_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            blob_id: "vault".to_string(),
            strategy: MergeStrategy::default(),
            retry: RetryPolicy::default(),
            max_restarts: 3,
            max_remerges: 3,
            network_timeout: Duration::from_secs(30),
        }
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Last phase the cycle worked through.
    pub phase: SyncPhase,
    pub entry_count: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub local_changed: bool,
    pub uploaded: bool,
    /// Transport calls made, retries included.
    pub attempts: u32,
    pub restarts: u32,
    pub remote_revision: Option<String>,
}

impl SyncReport {
    /// Conflicts still waiting for a user decision.
    pub fn pending(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.conflicts
            .iter()
            .filter(|c| c.kind == crate::merge::ConflictKind::ManualPending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// A cycle was already running; it will run once more when it finishes.
    Coalesced,
}
