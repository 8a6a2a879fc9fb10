//! Per-entry access log and anomaly detection.
//!
//! Every read of a secret through the store is appended here. Detection is
//! advisory: bursts of access by one actor to one entry produce
//! [`AnomalyEvent`]s (logged and broadcast), but nothing is ever blocked.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Default number of accesses tolerated inside one window.
pub const DEFAULT_THRESHOLD: usize = 10;

/// Default sliding window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60 * 60);

const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Timestamps are in milliseconds; shorter windows are widened to this.
const MIN_WINDOW: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Access log lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, AccessError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    View,
    Copy,
    Edit,
    Share,
    Revoke,
}

/// One append-only access record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub entry_id: Uuid,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub actor: String,
    pub access_type: AccessType,
}

/// Backing storage for access records.
pub trait AccessLogStore: Send + Sync {
    fn append(&self, entry: AccessLogEntry) -> Result<()>;

    /// All records, in append order.
    fn entries(&self) -> Result<Vec<AccessLogEntry>>;
}

/// In-process log, used by tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryAccessLog {
    entries: Mutex<Vec<AccessLogEntry>>,
}

impl MemoryAccessLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccessLogStore for MemoryAccessLog {
    fn append(&self, entry: AccessLogEntry) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| AccessError::Poisoned)?
            .push(entry);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AccessLogEntry>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| AccessError::Poisoned)?
            .clone())
    }
}

/// JSON-lines file log.
pub struct FileAccessLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileAccessLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AccessLogStore for FileAccessLog {
    fn append(&self, entry: AccessLogEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = self.file.lock().map_err(|_| AccessError::Poisoned)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AccessLogEntry>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                // A torn final line after a crash is skipped, not fatal.
                Err(e) => warn!("Skipping unreadable access log line: {}", e),
            }
        }
        Ok(entries)
    }
}

/// Thresholds for anomaly detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyConfig {
    /// Alert when an actor exceeds this many accesses in one window.
    pub threshold: usize,
    pub window: Duration,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            window: DEFAULT_WINDOW,
        }
    }
}

/// A burst of accesses by one actor to one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub entry_id: Uuid,
    pub actor: String,
    /// Accesses inside the densest window.
    pub count: usize,
    pub window_start: i64,
    pub window_end: i64,
}

pub struct AccessTracker {
    log: Box<dyn AccessLogStore>,
    config: AnomalyConfig,
    alerts: broadcast::Sender<AnomalyEvent>,
}

impl AccessTracker {
    pub fn new(log: Box<dyn AccessLogStore>, config: AnomalyConfig) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            log,
            config: AnomalyConfig {
                window: config.window.max(MIN_WINDOW),
                ..config
            },
            alerts,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryAccessLog::new()), AnomalyConfig::default())
    }

    pub fn config(&self) -> AnomalyConfig {
        self.config
    }

    /// Receive anomaly alerts as they are detected.
    pub fn subscribe(&self) -> broadcast::Receiver<AnomalyEvent> {
        self.alerts.subscribe()
    }

    /// Record an access at the current time.
    pub fn track_access(
        &self,
        entry_id: Uuid,
        actor: &str,
        access_type: AccessType,
    ) -> Result<()> {
        self.record(AccessLogEntry {
            entry_id,
            timestamp: Utc::now().timestamp_millis(),
            actor: actor.to_string(),
            access_type,
        })
    }

    /// Record an access with an explicit timestamp.
    pub fn record(&self, entry: AccessLogEntry) -> Result<()> {
        self.log.append(entry)
    }

    pub fn entries(&self) -> Result<Vec<AccessLogEntry>> {
        self.log.entries()
    }

    /// Scan the log for `(entry, actor)` pairs with more than `threshold`
    /// accesses inside any window that ends at or before `now` (millis).
    pub fn detect_anomalies(&self, now: i64) -> Result<Vec<AnomalyEvent>> {
        let window_ms = i64::try_from(self.config.window.as_millis()).unwrap_or(i64::MAX);

        let mut grouped: BTreeMap<(Uuid, String), Vec<i64>> = BTreeMap::new();
        for entry in self.log.entries()? {
            if entry.timestamp <= now {
                grouped
                    .entry((entry.entry_id, entry.actor))
                    .or_default()
                    .push(entry.timestamp);
            }
        }

        let mut events = Vec::new();
        for ((entry_id, actor), mut stamps) in grouped {
            if stamps.len() <= self.config.threshold {
                continue;
            }
            stamps.sort_unstable();

            if let Some((count, start, end)) = densest_window(&stamps, window_ms) {
                if count > self.config.threshold {
                    events.push(AnomalyEvent {
                        entry_id,
                        actor,
                        count,
                        window_start: start,
                        window_end: end,
                    });
                }
            }
        }

        for event in &events {
            warn!(
                entry_id = %event.entry_id,
                actor = %event.actor,
                count = event.count,
                "Unusual access pattern detected"
            );
            // No subscribers is fine; alerts are advisory.
            let _ = self.alerts.send(event.clone());
        }

        Ok(events)
    }
}

/// Largest number of sorted timestamps that fit in a half-open window of
/// `window_ms`, with the first and last timestamp of that window.
fn densest_window(stamps: &[i64], window_ms: i64) -> Option<(usize, i64, i64)> {
    let window_ms = window_ms.max(1);
    let mut best: Option<(usize, i64, i64)> = None;
    let mut start = 0;
    for end in 0..stamps.len() {
        while stamps[end].saturating_sub(stamps[start]) >= window_ms {
            start += 1;
        }
        let count = end - start + 1;
        if best.map_or(true, |(c, _, _)| count > c) {
            best = Some((count, stamps[start], stamps[end]));
        }
    }
    best
}
