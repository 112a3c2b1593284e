//! Cryptography module for lanvault
//!
//! Provides AES-256-GCM field encryption with Argon2id password hashing
//! and an HKDF-SHA256 key hierarchy. Nothing leaves the session unencrypted.

mod encryption;
mod kdf;
mod keys;

pub use encryption::{
    decrypt, decrypt_from_string, encrypt, encrypt_to_string, EncryptedBlob,
};
pub use kdf::{derive_master_key, KdfParams};
pub use keys::{
    constant_time_eq, derive_keys, hash_master_key, verify_master_password, DerivedKeyBundle,
    MasterKey, EXPORT_KEY_LABEL, SYNC_KEY_LABEL, VAULT_KEY_LABEL,
};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 16;

/// Size of a SHA-256 digest
pub const HASH_SIZE: usize = 32;
