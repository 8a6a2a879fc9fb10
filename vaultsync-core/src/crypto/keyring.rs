//! Key hierarchy and key provisioning.
//!
//! Master passphrase → Argon2id → master key → wraps → vault key → HKDF →
//! record / blob sub-keys.
//!
//! The rest of the crate never sees the passphrase or the master key. It asks
//! a [`KeyProvider`] for a [`VaultKey`] whenever it needs one and lets the key
//! drop (and wipe) as soon as the operation is over.

use crate::crypto::{
    cipher::VaultKey,
    kdf::{derive_master_key, KdfParams},
    CryptoError, Result,
};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// The master key derived from the master passphrase.
///
/// Only used to wrap/unwrap the vault key; never persisted.
#[derive(ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; 32],
}

impl MasterKey {
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// A wrapped (encrypted) vault key that can be safely stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Wrapped (encrypted) vault key
    pub wrapped_key: Vec<u8>,

    /// Nonce used for wrapping
    pub nonce: [u8; 12],

    /// Authentication tag
    pub auth_tag: [u8; 16],
}

/// Creates and unlocks the key material persisted with a vault.
pub struct KeyHierarchy;

impl KeyHierarchy {
    /// Initialize key material for a new vault.
    ///
    /// Returns the KDF parameters and the wrapped vault key for storage, plus
    /// the master key so the caller can build a provider without running the
    /// KDF twice.
    pub fn initialize_vault(
        passphrase: &[u8],
        kdf_params: KdfParams,
    ) -> Result<(KdfParams, WrappedKey, MasterKey)> {
        let master_key = MasterKey::from_bytes(derive_master_key(passphrase, &kdf_params)?);
        let vault_key = VaultKey::generate();
        let wrapped = Self::wrap(&master_key, &vault_key)?;
        Ok((kdf_params, wrapped, master_key))
    }

    /// Derive the master key and check it against the wrapped vault key.
    pub fn unlock_vault(
        passphrase: &[u8],
        kdf_params: &KdfParams,
        wrapped: &WrappedKey,
    ) -> Result<MasterKey> {
        let master_key = MasterKey::from_bytes(derive_master_key(passphrase, kdf_params)?);
        // Fails with AuthenticationFailed on a wrong passphrase.
        Self::unwrap(&master_key, wrapped)?;
        Ok(master_key)
    }

    /// Wrap the vault key with the master key.
    pub fn wrap(master_key: &MasterKey, vault_key: &VaultKey) -> Result<WrappedKey> {
        let cipher = Aes256Gcm::new(master_key.as_bytes().into());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let nonce_bytes: [u8; 12] = nonce.into();

        let ciphertext = cipher
            .encrypt(&nonce, vault_key.as_bytes().as_ref())
            .map_err(|e| CryptoError::EncryptionFailed(format!("Failed to wrap key: {}", e)))?;

        if ciphertext.len() < 16 {
            return Err(CryptoError::EncryptionFailed(
                "Wrapped key too short".to_string(),
            ));
        }

        let tag_start = ciphertext.len() - 16;
        let auth_tag: [u8; 16] = ciphertext[tag_start..]
            .try_into()
            .map_err(|_| CryptoError::EncryptionFailed("Invalid auth tag".to_string()))?;

        Ok(WrappedKey {
            wrapped_key: ciphertext[..tag_start].to_vec(),
            nonce: nonce_bytes,
            auth_tag,
        })
    }

    /// Unwrap the vault key with the master key.
    pub fn unwrap(master_key: &MasterKey, wrapped: &WrappedKey) -> Result<VaultKey> {
        let cipher = Aes256Gcm::new(master_key.as_bytes().into());
        let nonce = Nonce::from(wrapped.nonce);

        let mut ciphertext_with_tag = wrapped.wrapped_key.clone();
        ciphertext_with_tag.extend_from_slice(&wrapped.auth_tag);

        let key_bytes = zeroize::Zeroizing::new(
            cipher
                .decrypt(&nonce, ciphertext_with_tag.as_ref())
                .map_err(|_| CryptoError::AuthenticationFailed)?,
        );

        VaultKey::from_slice(&key_bytes)
    }
}

/// Supplies the unwrapped vault key for a single operation.
///
/// Stands in for the platform key-protection mechanism (OS keychain, secure
/// enclave, passphrase prompt). Implementations hand out a fresh owned
/// [`VaultKey`] per call; callers drop it as soon as they are done.
pub trait KeyProvider: Send + Sync {
    fn unwrap_key(&self) -> Result<VaultKey>;
}

/// Run `f` with a freshly unwrapped key. The key is wiped when this returns,
/// on the error path as well.
pub fn with_key<T, E>(
    provider: &dyn KeyProvider,
    f: impl FnOnce(&VaultKey) -> std::result::Result<T, E>,
) -> std::result::Result<T, E>
where
    E: From<CryptoError>,
{
    let key = provider.unwrap_key()?;
    f(&key)
}

/// Provider backed by a passphrase-derived master key and the wrapped vault key.
pub struct PassphraseKeyProvider {
    master_key: MasterKey,
    wrapped: WrappedKey,
}

impl PassphraseKeyProvider {
    /// Run the KDF and verify the passphrase against the wrapped key.
    pub fn unlock(passphrase: &[u8], kdf_params: &KdfParams, wrapped: WrappedKey) -> Result<Self> {
        let master_key = KeyHierarchy::unlock_vault(passphrase, kdf_params, &wrapped)?;
        Ok(Self {
            master_key,
            wrapped,
        })
    }

    pub fn from_parts(master_key: MasterKey, wrapped: WrappedKey) -> Self {
        Self {
            master_key,
            wrapped,
        }
    }
}

impl KeyProvider for PassphraseKeyProvider {
    fn unwrap_key(&self) -> Result<VaultKey> {
        KeyHierarchy::unwrap(&self.master_key, &self.wrapped)
    }
}

/// Provider holding a raw vault key. Used by tests and by embedders that
/// unwrap keys themselves.
#[derive(ZeroizeOnDrop)]
pub struct StaticKeyProvider {
    key: [u8; 32],
}

impl StaticKeyProvider {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn random() -> Self {
        Self::new(rand::random())
    }
}

impl KeyProvider for StaticKeyProvider {
    fn unwrap_key(&self) -> Result<VaultKey> {
        Ok(VaultKey::from_bytes(self.key))
    }
}
