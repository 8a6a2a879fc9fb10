//! Argon2id key derivation for the master passphrase.
//!
//! Default parameters:
//! - Memory cost: 256 MB (262,144 KiB)
//! - Time cost: 3 iterations
//! - Parallelism: 4 lanes
//! - Output length: 32 bytes (256 bits)
//! - Salt length: 16 bytes

use crate::crypto::{CryptoError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

/// Lowest memory cost accepted when opening a vault (64 MB).
pub const MIN_MEM_COST_KIB: u32 = 65_536;

/// Parameters for Argon2id key derivation, stored alongside the wrapped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Salt for key derivation (16 bytes)
    pub salt: [u8; 16],

    /// Memory cost in KiB
    pub mem_cost: u32,

    /// Time cost (number of iterations)
    pub time_cost: u32,

    /// Parallelism (number of lanes)
    pub parallelism: u32,

    /// Output length in bytes
    pub output_length: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            salt: rand::random(),
            mem_cost: 262_144,
            time_cost: 3,
            parallelism: 4,
            output_length: 32,
        }
    }
}

impl KdfParams {
    /// Create new KDF parameters with a random salt
    pub fn new() -> Self {
        Self::default()
    }

    /// The cheapest parameters [`validate`](Self::validate) accepts.
    /// Meant for tests and low-memory devices.
    pub fn minimum() -> Self {
        Self {
            mem_cost: MIN_MEM_COST_KIB,
            time_cost: 1,
            parallelism: 1,
            ..Self::default()
        }
    }

    /// Verify that parameters are within acceptable ranges
    pub fn validate(&self) -> Result<()> {
        if self.mem_cost < MIN_MEM_COST_KIB {
            return Err(CryptoError::KdfFailed(
                "Memory cost too low (minimum: 64 MB)".to_string(),
            ));
        }
        if self.time_cost < 1 {
            return Err(CryptoError::KdfFailed(
                "Time cost too low (minimum: 1)".to_string(),
            ));
        }
        if self.parallelism < 1 {
            return Err(CryptoError::KdfFailed(
                "Parallelism too low (minimum: 1)".to_string(),
            ));
        }
        if self.output_length != 32 {
            return Err(CryptoError::KdfFailed(
                "Output length must be 32 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Derive a 32-byte master key from a passphrase using Argon2id.
pub fn derive_master_key(passphrase: &[u8], params: &KdfParams) -> Result<[u8; 32]> {
    params.validate()?;

    let argon_params = Params::new(
        params.mem_cost,
        params.time_cost,
        params.parallelism,
        Some(params.output_length as usize),
    )
    .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut master_key = [0u8; 32];
    argon2
        .hash_password_into(passphrase, &params.salt, &mut master_key)
        .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;

    Ok(master_key)
}
