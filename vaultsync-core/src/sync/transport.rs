//! Remote storage for the sealed vault blob.
//!
//! The provider only ever sees opaque bytes and a revision tag. Uploads are
//! conditional on the revision the caller last saw, so two devices racing to
//! publish cannot silently overwrite each other.

use crate::sync::models::RemoteBlob;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote revision changed: expected {expected:?}, found {found:?}")]
    VersionConflict {
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("Invalid blob id: {0}")]
    InvalidBlobId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::Io(_) => true,
            Self::VersionConflict { .. } | Self::InvalidBlobId(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[async_trait]
pub trait BlobTransport: Send + Sync {
    /// Fetch the blob, or `None` if nothing has been published yet.
    async fn download(&self, blob_id: &str) -> Result<Option<RemoteBlob>>;

    /// Publish `bytes` if the remote is still at `expected_revision`
    /// (`None` meaning "does not exist yet"). Returns the new revision.
    async fn upload(
        &self,
        blob_id: &str,
        bytes: Vec<u8>,
        expected_revision: Option<&str>,
    ) -> Result<String>;
}

/// Content-derived revision tag.
pub fn revision_of(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(bytes))
}

fn check_blob_id(blob_id: &str) -> Result<()> {
    let valid = !blob_id.is_empty()
        && blob_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !blob_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidBlobId(blob_id.to_string()))
    }
}

#[derive(Default)]
struct MemoryState {
    blobs: HashMap<String, RemoteBlob>,
    fail_next: u32,
    conflict_next: u32,
    delay: Option<Duration>,
    downloads: u32,
    uploads: u32,
}

/// In-process transport with fault injection for tests.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with a network error.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Reject the next `n` uploads with a version conflict.
    pub fn conflict_next(&self, n: u32) {
        self.lock().conflict_next = n;
    }

    /// Sleep this long before answering any call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Overwrite the stored blob unconditionally.
    pub fn put(&self, blob_id: &str, bytes: Vec<u8>) -> String {
        let revision = revision_of(&bytes);
        self.lock().blobs.insert(
            blob_id.to_string(),
            RemoteBlob {
                bytes,
                revision: revision.clone(),
            },
        );
        revision
    }

    pub fn get(&self, blob_id: &str) -> Option<RemoteBlob> {
        self.lock().blobs.get(blob_id).cloned()
    }

    pub fn download_count(&self) -> u32 {
        self.lock().downloads
    }

    pub fn upload_count(&self) -> u32 {
        self.lock().uploads
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // Test double: a poisoned lock still holds usable state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn pause(&self) {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn injected_failure(state: &mut MemoryState) -> Result<()> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Network("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobTransport for MemoryTransport {
    async fn download(&self, blob_id: &str) -> Result<Option<RemoteBlob>> {
        check_blob_id(blob_id)?;
        self.pause().await;

        let mut state = self.lock();
        state.downloads += 1;
        Self::injected_failure(&mut state)?;
        Ok(state.blobs.get(blob_id).cloned())
    }

    async fn upload(
        &self,
        blob_id: &str,
        bytes: Vec<u8>,
        expected_revision: Option<&str>,
    ) -> Result<String> {
        check_blob_id(blob_id)?;
        self.pause().await;

        let mut state = self.lock();
        state.uploads += 1;
        Self::injected_failure(&mut state)?;

        let current = state.blobs.get(blob_id).map(|b| b.revision.clone());
        if state.conflict_next > 0 || current.as_deref() != expected_revision {
            state.conflict_next = state.conflict_next.saturating_sub(1);
            return Err(TransportError::VersionConflict {
                expected: expected_revision.map(str::to_string),
                found: current,
            });
        }

        let revision = revision_of(&bytes);
        state.blobs.insert(
            blob_id.to_string(),
            RemoteBlob {
                bytes,
                revision: revision.clone(),
            },
        );
        Ok(revision)
    }
}

/// A local folder standing in for any file-sync provider (a mounted cloud
/// drive, a network share). Each blob is one file named `<blob_id>.vsb`.
pub struct DirectoryTransport {
    root: PathBuf,
    // Serializes check-and-write within this process.
    write_lock: tokio::sync::Mutex<()>,
}

impl DirectoryTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, blob_id: &str) -> Result<PathBuf> {
        check_blob_id(blob_id)?;
        Ok(self.root.join(format!("{}.vsb", blob_id)))
    }

    async fn read(path: &Path) -> Result<Option<RemoteBlob>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let revision = revision_of(&bytes);
                Ok(Some(RemoteBlob { bytes, revision }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobTransport for DirectoryTransport {
    async fn download(&self, blob_id: &str) -> Result<Option<RemoteBlob>> {
        let path = self.blob_path(blob_id)?;
        Self::read(&path).await
    }

    async fn upload(
        &self,
        blob_id: &str,
        bytes: Vec<u8>,
        expected_revision: Option<&str>,
    ) -> Result<String> {
        let path = self.blob_path(blob_id)?;
        let _guard = self.write_lock.lock().await;

        let current = Self::read(&path).await?.map(|b| b.revision);
        if current.as_deref() != expected_revision {
            return Err(TransportError::VersionConflict {
                expected: expected_revision.map(str::to_string),
                found: current,
            });
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let revision = revision_of(&bytes);
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", blob_id, Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(blob_id, revision = %revision, "Published blob");
        Ok(revision)
    }
}
