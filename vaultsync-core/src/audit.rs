//! Audit logging for security events and sync operations

use crate::merge::ConflictKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize audit entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit writer lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// Audit log entry types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    /// Vault operations
    VaultCreated,
    VaultUnlocked {
        success: bool,
    },

    /// Entry operations
    EntryCreated {
        entry_id: Uuid,
    },
    EntryViewed {
        entry_id: Uuid,
    },
    EntryModified {
        entry_id: Uuid,
    },
    EntryDeleted {
        entry_id: Uuid,
    },
    EntryRestored {
        entry_id: Uuid,
    },
    TombstonesPurged {
        count: usize,
    },

    /// Sync events
    SyncCompleted {
        conflicts: usize,
        uploaded: bool,
    },
    SyncFailed {
        reason: String,
    },
    ConflictDetected {
        entry_id: Uuid,
        kind: ConflictKind,
    },
    ConflictResolved {
        entry_id: Uuid,
    },

    /// Security events
    AnomalyDetected {
        entry_id: Uuid,
        actor: String,
        count: usize,
    },
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,
    /// Event type
    pub event_type: AuditEventType,
    /// Event severity (0-5, where 5 is most critical)
    pub severity: u8,
    /// Additional context data
    pub context: String,
    /// Device that produced the event
    pub device_id: Option<String>,
}

/// Append-only JSON lines audit log
pub struct AuditLogger {
    log_file: PathBuf,
    device_id: Option<String>,
    writer: Mutex<File>,
}

impl AuditLogger {
    /// Create a new audit logger writing to `audit.log` inside `log_dir`
    pub fn new(log_dir: &Path) -> Result<Self> {
        let log_file = log_dir.join("audit.log");
        std::fs::create_dir_all(log_dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;

        info!("Audit logger initialized: {:?}", log_file);

        Ok(Self {
            log_file,
            device_id: None,
            writer: Mutex::new(file),
        })
    }

    /// Stamp every subsequent entry with `device_id`.
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.log_file
    }

    /// Log an audit event
    pub fn log(&self, event_type: AuditEventType, context: &str) -> Result<()> {
        let severity = Self::severity_for_event(&event_type);

        let entry = AuditEntry {
            timestamp: Utc::now(),
            event_type,
            severity,
            context: context.to_string(),
            device_id: self.device_id.clone(),
        };

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut writer = self.writer.lock().map_err(|_| AuditError::Poisoned)?;
        writer.write_all(line.as_bytes())?;
        writer.flush()?;

        Ok(())
    }

    /// Get severity level for an event type (0-5)
    fn severity_for_event(event: &AuditEventType) -> u8 {
        match event {
            // Critical events (5)
            AuditEventType::VaultCreated | AuditEventType::VaultUnlocked { success: false } => 5,

            // High severity (4)
            AuditEventType::EntryDeleted { .. }
            | AuditEventType::AnomalyDetected { .. }
            | AuditEventType::SyncFailed { .. } => 4,

            // Medium-high severity (3)
            AuditEventType::EntryModified { .. }
            | AuditEventType::ConflictDetected { .. }
            | AuditEventType::TombstonesPurged { .. } => 3,

            // Medium severity (2)
            AuditEventType::EntryCreated { .. }
            | AuditEventType::EntryRestored { .. }
            | AuditEventType::ConflictResolved { .. } => 2,

            // Low severity (1)
            AuditEventType::EntryViewed { .. } | AuditEventType::SyncCompleted { .. } => 1,

            // Info (0)
            AuditEventType::VaultUnlocked { success: true } => 0,
        }
    }

    /// Most recent entries first, at most `limit`
    pub fn get_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut entries = self.read_all()?;
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    /// Get audit entries since a specific timestamp
    pub fn get_entries_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|entry| entry.timestamp > since)
            .collect())
    }

    /// Get audit entries by severity level
    pub fn get_entries_by_severity(&self, min_severity: u8) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|entry| entry.severity >= min_severity)
            .collect())
    }

    fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let content = std::fs::read_to_string(&self.log_file)?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
            .collect())
    }
}

/// Get the default audit log directory
pub fn get_audit_log_dir() -> PathBuf {
    crate::platform::get_data_dir().join("audit")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_dir() -> PathBuf {
        let dir = std::env::temp_dir()
            .join("vaultsync_test_audit")
            .join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_severity_levels() {
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::VaultCreated),
            5
        );
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::AnomalyDetected {
                entry_id: Uuid::nil(),
                actor: "alice".to_string(),
                count: 11,
            }),
            4
        );
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::ConflictDetected {
                entry_id: Uuid::nil(),
                kind: ConflictKind::TombstoneRace,
            }),
            3
        );
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::SyncCompleted {
                conflicts: 0,
                uploaded: true,
            }),
            1
        );
        assert_eq!(
            AuditLogger::severity_for_event(&AuditEventType::VaultUnlocked { success: true }),
            0
        );
    }

    #[test]
    fn test_audit_logger_creates_file() {
        let dir = make_test_dir();
        let logger = AuditLogger::new(&dir).unwrap();
        assert!(logger.path().exists());
    }

    #[test]
    fn test_audit_log_and_get_entries() {
        let dir = make_test_dir();
        let logger = AuditLogger::new(&dir).unwrap().with_device("laptop");
        let id = Uuid::new_v4();

        logger.log(AuditEventType::VaultCreated, "init").unwrap();
        logger
            .log(AuditEventType::EntryCreated { entry_id: id }, "add")
            .unwrap();

        let entries = logger.get_entries(10).unwrap();
        assert_eq!(entries.len(), 2);
        // newest first
        assert_eq!(entries[0].event_type, AuditEventType::EntryCreated { entry_id: id });
        assert_eq!(entries[0].device_id.as_deref(), Some("laptop"));
        assert_eq!(entries[1].severity, 5);
    }

    #[test]
    fn test_audit_get_entries_with_limit() {
        let dir = make_test_dir();
        let logger = AuditLogger::new(&dir).unwrap();
        for _ in 0..5 {
            logger
                .log(
                    AuditEventType::EntryViewed {
                        entry_id: Uuid::new_v4(),
                    },
                    "",
                )
                .unwrap();
        }
        assert_eq!(logger.get_entries(3).unwrap().len(), 3);
    }

    #[test]
    fn test_audit_get_entries_since() {
        let dir = make_test_dir();
        let logger = AuditLogger::new(&dir).unwrap();
        let before = Utc::now() - chrono::Duration::seconds(60);

        logger.log(AuditEventType::VaultCreated, "").unwrap();

        assert_eq!(logger.get_entries_since(before).unwrap().len(), 1);
        let later = Utc::now() + chrono::Duration::seconds(60);
        assert!(logger.get_entries_since(later).unwrap().is_empty());
    }

    #[test]
    fn test_audit_get_entries_by_severity() {
        let dir = make_test_dir();
        let logger = AuditLogger::new(&dir).unwrap();

        logger
            .log(
                AuditEventType::SyncCompleted {
                    conflicts: 0,
                    uploaded: false,
                },
                "",
            )
            .unwrap();
        logger
            .log(
                AuditEventType::SyncFailed {
                    reason: "timeout".to_string(),
                },
                "",
            )
            .unwrap();

        let high = logger.get_entries_by_severity(4).unwrap();
        assert_eq!(high.len(), 1);
        assert!(matches!(high[0].event_type, AuditEventType::SyncFailed { .. }));
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        let dir = make_test_dir();
        let logger = AuditLogger::new(&dir).unwrap();
        logger.log(AuditEventType::VaultCreated, "").unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(logger.path())
            .unwrap()
            .write_all(b"not json\n")
            .unwrap();

        assert_eq!(logger.get_entries(10).unwrap().len(), 1);
    }
}
