//! Sync encryption: seal and open whole-vault snapshots for the provider.
//!
//! The blob is the canonical snapshot JSON, padded to a size bucket, sealed
//! with the blob sub-key into a standard envelope.

use crate::crypto::envelope::{open_from_bytes, pad_payload, seal_to_bytes, unpad_payload};
use crate::crypto::VaultKey;
use crate::store::VaultSnapshot;
use crate::sync::SyncError;
use zeroize::Zeroizing;

/// Encrypt a snapshot for upload.
pub fn seal_snapshot(snapshot: &VaultSnapshot, key: &VaultKey) -> Result<Vec<u8>, SyncError> {
    let json = Zeroizing::new(
        snapshot
            .to_canonical_json()
            .map_err(|e| SyncError::Format(e.to_string()))?,
    );
    let padded = Zeroizing::new(pad_payload(&json));
    Ok(seal_to_bytes(&padded, &key.blob_key()?)?)
}

/// Decrypt a downloaded blob.
///
/// A wrong key or tampered bytes give `AuthenticationFailure`; an unknown
/// envelope or snapshot version gives `Format`.
pub fn open_snapshot(bytes: &[u8], key: &VaultKey) -> Result<VaultSnapshot, SyncError> {
    let plaintext = open_from_bytes(bytes, &key.blob_key()?)?;
    let json = unpad_payload(plaintext.as_bytes())?;
    VaultSnapshot::from_canonical_json(json).map_err(|e| SyncError::Format(e.to_string()))
}
