//! Authenticated envelopes for records and vault blobs.
//!
//! Wire format:
//! `magic(3) || format_version(1) || nonce(12) || ciphertext || auth_tag(16)`
//!
//! The 4-byte header is bound as associated data, so a downgraded or
//! rewritten version byte fails authentication instead of being parsed.

use crate::crypto::{CryptoError, Result, SecureBuffer, SubKey};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};

/// Envelope magic bytes.
pub const ENVELOPE_MAGIC: &[u8; 3] = b"VSE";

/// Current envelope format version.
pub const ENVELOPE_FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = 4;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Smallest valid envelope: header + nonce + tag, sealing an empty payload.
pub const MIN_ENVELOPE_LEN: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

/// A sealed payload together with everything needed to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub format_version: u8,
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the 16-byte GCM tag appended.
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    fn header(format_version: u8) -> [u8; HEADER_LEN] {
        [
            ENVELOPE_MAGIC[0],
            ENVELOPE_MAGIC[1],
            ENVELOPE_MAGIC[2],
            format_version,
        ]
    }

    /// Serialize to the wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&Self::header(self.format_version));
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the wire format. Does not authenticate anything.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_ENVELOPE_LEN {
            return Err(CryptoError::Format(format!(
                "envelope too short: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[..3] != ENVELOPE_MAGIC {
            return Err(CryptoError::Format("bad magic".to_string()));
        }
        let format_version = bytes[3];
        if format_version != ENVELOPE_FORMAT_VERSION {
            return Err(CryptoError::UnsupportedVersion(format_version));
        }

        let nonce: [u8; NONCE_LEN] = bytes[HEADER_LEN..HEADER_LEN + NONCE_LEN]
            .try_into()
            .map_err(|_| CryptoError::Format("invalid nonce length".to_string()))?;

        Ok(Self {
            format_version,
            nonce,
            ciphertext: bytes[HEADER_LEN + NONCE_LEN..].to_vec(),
        })
    }
}

/// Seal `plaintext` under `key` with a fresh random nonce.
///
/// Every call draws a new 96-bit nonce from the OS RNG; a nonce is never
/// reused for a given key.
pub fn seal(plaintext: &[u8], key: &SubKey) -> Result<Envelope> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let header = Envelope::header(ENVELOPE_FORMAT_VERSION);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &header,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    Ok(Envelope {
        format_version: ENVELOPE_FORMAT_VERSION,
        nonce: nonce.into(),
        ciphertext,
    })
}

/// Open an envelope. A tag mismatch is always `AuthenticationFailed`;
/// no partial plaintext is ever returned.
pub fn open(envelope: &Envelope, key: &SubKey) -> Result<SecureBuffer> {
    if envelope.format_version != ENVELOPE_FORMAT_VERSION {
        return Err(CryptoError::UnsupportedVersion(envelope.format_version));
    }
    if envelope.ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Format("ciphertext too short".to_string()));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Nonce::from(envelope.nonce);
    let header = Envelope::header(envelope.format_version);

    let plaintext = cipher
        .decrypt(
            &nonce,
            Payload {
                msg: envelope.ciphertext.as_slice(),
                aad: &header,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    Ok(SecureBuffer::new(plaintext))
}

/// Seal and serialize in one step.
pub fn seal_to_bytes(plaintext: &[u8], key: &SubKey) -> Result<Vec<u8>> {
    Ok(seal(plaintext, key)?.to_bytes())
}

/// Parse and open in one step.
pub fn open_from_bytes(bytes: &[u8], key: &SubKey) -> Result<SecureBuffer> {
    open(&Envelope::from_bytes(bytes)?, key)
}

/// Pad payload to fixed-size bucket to hide the vault size from the provider.
///
/// Buckets: 256, 512, 1024, 2048, 4096, 8192 bytes, then multiples of 8192.
/// The original length is stored as an 8-byte little-endian prefix.
pub fn pad_payload(data: &[u8]) -> Vec<u8> {
    let buckets = [256, 512, 1024, 2048, 4096, 8192];
    let total_needed = data.len() + 8;
    let bucket_size = buckets
        .iter()
        .find(|&&b| b >= total_needed)
        .copied()
        .unwrap_or(total_needed.div_ceil(8192) * 8192);

    let mut padded = Vec::with_capacity(bucket_size);
    padded.extend_from_slice(&(data.len() as u64).to_le_bytes());
    padded.extend_from_slice(data);
    padded.resize(bucket_size, 0u8);
    padded
}

/// Remove padding from a padded payload.
pub fn unpad_payload(padded: &[u8]) -> Result<&[u8]> {
    if padded.len() < 8 {
        return Err(CryptoError::Format("Padded payload too short".to_string()));
    }

    let len_bytes: [u8; 8] = padded[..8]
        .try_into()
        .map_err(|_| CryptoError::Format("Invalid length prefix".to_string()))?;
    let original_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| CryptoError::Format("Invalid length prefix".to_string()))?;

    if original_len > padded.len() - 8 {
        return Err(CryptoError::Format(
            "Invalid padded payload length".to_string(),
        ));
    }

    Ok(&padded[8..8 + original_len])
}
