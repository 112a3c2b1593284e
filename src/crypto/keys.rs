//! Key Management for lanvault
//!
//! Implements a two-level key hierarchy:
//! - Master Key: Argon2id output, lives only for the duration of an unlock
//! - Derived keys: vault, sync and export keys expanded from the master key
//!   with HKDF-SHA256 and distinct labels

use crate::crypto::{derive_master_key, KdfParams, HASH_SIZE, KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use ring::digest::{digest, SHA256};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use std::fmt;
use zeroize::Zeroizing;

/// HKDF label for the field encryption key
pub const VAULT_KEY_LABEL: &[u8] = b"vault-encryption-key";

/// HKDF label for the sync traffic key
pub const SYNC_KEY_LABEL: &[u8] = b"sync-handshake-key";

/// HKDF label for the export key
pub const EXPORT_KEY_LABEL: &[u8] = b"export-encryption-key";

/// Master key derived from the user password. Zeroed on drop.
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl MasterKey {
    pub(crate) fn from_zeroizing(key: Zeroizing<[u8; KEY_SIZE]>) -> Self {
        MasterKey { key }
    }

    /// Wrap existing key material
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        MasterKey {
            key: Zeroizing::new(bytes),
        }
    }

    /// Get the raw key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Expand a 32-byte subkey for a specific purpose
    fn expand(&self, label: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let salt = Salt::new(HKDF_SHA256, &[]);
        let prk = salt.extract(&self.key[..]);

        let mut output = Zeroizing::new([0u8; KEY_SIZE]);
        prk.expand(&[label], HkdfKeyType)
            .map_err(|_| Error::KeyDerivation("HKDF expansion failed".to_string()))?
            .fill(&mut output[..])
            .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;

        Ok(output)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([redacted])")
    }
}

/// HKDF key type for ring
struct HkdfKeyType;

impl hkdf::KeyType for HkdfKeyType {
    fn len(&self) -> usize {
        KEY_SIZE
    }
}

/// The three purpose-scoped keys held by an unlocked session.
///
/// Deliberately neither `Clone` nor `Copy`: the session is the only owner
/// and every key is zeroed when the bundle is dropped.
pub struct DerivedKeyBundle {
    vault_key: Zeroizing<[u8; KEY_SIZE]>,
    sync_key: Zeroizing<[u8; KEY_SIZE]>,
    export_key: Zeroizing<[u8; KEY_SIZE]>,
}

impl DerivedKeyBundle {
    /// Key for stored entry and folder fields
    pub fn vault_key(&self) -> &[u8; KEY_SIZE] {
        &self.vault_key
    }

    /// Key for sealing sync deltas
    pub fn sync_key(&self) -> &[u8; KEY_SIZE] {
        &self.sync_key
    }

    /// Key for backup exports
    pub fn export_key(&self) -> &[u8; KEY_SIZE] {
        &self.export_key
    }
}

impl fmt::Debug for DerivedKeyBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKeyBundle([redacted])")
    }
}

/// Expand the master key into the vault, sync and export keys
pub fn derive_keys(master: &MasterKey) -> Result<DerivedKeyBundle> {
    Ok(DerivedKeyBundle {
        vault_key: master.expand(VAULT_KEY_LABEL)?,
        sync_key: master.expand(SYNC_KEY_LABEL)?,
        export_key: master.expand(EXPORT_KEY_LABEL)?,
    })
}

/// SHA-256 of the vault key, stored to verify candidate passwords
pub fn hash_master_key(keys: &DerivedKeyBundle) -> [u8; HASH_SIZE] {
    let hash = digest(&SHA256, keys.vault_key());
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(hash.as_ref());
    out
}

/// Re-derive keys from `password` and compare against the stored hash.
///
/// The derived master key and bundle are dropped (and zeroed) before
/// returning, whatever the outcome.
pub fn verify_master_password(
    password: &[u8],
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
    expected_hash: &[u8],
) -> Result<bool> {
    let master = derive_master_key(password, salt, params)?;
    let keys = derive_keys(&master)?;
    drop(master);
    let candidate = Zeroizing::new(hash_master_key(&keys));
    Ok(constant_time_eq(&candidate[..], expected_hash))
}

/// Constant-time byte comparison to prevent timing attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
