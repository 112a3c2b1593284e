//! Argon2id password hashing
//!
//! Turns a master password and salt into raw master key bytes. This is
//! deliberately slow and memory hungry; callers on an async runtime must
//! run it through `spawn_blocking`.

use crate::crypto::{MasterKey, KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Block, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Number of passes
    pub time_cost: u32,
    /// Degree of parallelism (lanes)
    pub parallelism: u32,
}

impl KdfParams {
    /// Production defaults: 64 MiB, 3 passes, 4 lanes
    pub const DEFAULT: KdfParams = KdfParams {
        memory_cost: 65536,
        time_cost: 3,
        parallelism: 4,
    };

    fn to_argon2(self) -> Result<Params> {
        Params::new(
            self.memory_cost,
            self.time_cost,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| Error::KeyDerivation(format!("invalid Argon2 parameters: {}", e)))
    }

    /// Check the parameters without running the hash
    pub fn validate(&self) -> Result<()> {
        self.to_argon2().map(|_| ())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Derive the master key from a password with Argon2id.
///
/// The working memory is reserved up front so that an allocation failure
/// surfaces as [`Error::KdfOutOfMemory`] instead of aborting the process.
/// Any password yields a key; a wrong one is only detectable later by hash
/// mismatch.
pub fn derive_master_key(
    password: &[u8],
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> Result<MasterKey> {
    let argon2_params = params.to_argon2()?;
    let block_count = argon2_params.block_count();
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut blocks: Vec<Block> = Vec::new();
    blocks
        .try_reserve_exact(block_count)
        .map_err(|_| Error::KdfOutOfMemory)?;
    blocks.resize(block_count, Block::default());

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    let result = argon2.hash_password_into_with_memory(password, salt, &mut key[..], &mut blocks);

    // Working memory holds password-dependent state
    blocks.fill(Block::default());

    result.map_err(|e| Error::KeyDerivation(format!("Argon2 failed: {}", e)))?;

    Ok(MasterKey::from_zeroizing(key))
}
