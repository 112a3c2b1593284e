//! Fixed-width vault header
//!
//! Layout (32 bytes, little-endian):
//!
//! | offset | size | field       |
//! |--------|------|-------------|
//! | 0      | 4    | version     |
//! | 4      | 16   | salt        |
//! | 20     | 4    | memory cost |
//! | 24     | 4    | time cost   |
//! | 28     | 4    | parallelism |

use crate::crypto::{KdfParams, SALT_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;

/// Current header format version
pub const HEADER_VERSION: u32 = 1;

/// Serialized header length in bytes
pub const HEADER_SIZE: usize = 32;

/// Vault metadata written once at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultHeader {
    pub version: u32,
    pub salt: [u8; SALT_SIZE],
    pub memory_cost: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl VaultHeader {
    /// Build a header for a new vault with a random salt
    pub fn generate(params: &KdfParams) -> Self {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);

        VaultHeader {
            version: HEADER_VERSION,
            salt,
            memory_cost: params.memory_cost,
            time_cost: params.time_cost,
            parallelism: params.parallelism,
        }
    }

    /// KDF parameters recorded at creation
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_cost: self.memory_cost,
            time_cost: self.time_cost,
            parallelism: self.parallelism,
        }
    }

    /// Encode to the 32-byte wire layout
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..20].copy_from_slice(&self.salt);
        out[20..24].copy_from_slice(&self.memory_cost.to_le_bytes());
        out[24..28].copy_from_slice(&self.time_cost.to_le_bytes());
        out[28..32].copy_from_slice(&self.parallelism.to_le_bytes());
        out
    }

    /// Decode from the 32-byte wire layout
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(Error::Format(format!(
                "vault header must be {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[4..20]);

        Ok(VaultHeader {
            version: read_u32(bytes, 0),
            salt,
            memory_cost: read_u32(bytes, 20),
            time_cost: read_u32(bytes, 24),
            parallelism: read_u32(bytes, 28),
        })
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VaultHeader {
        VaultHeader {
            version: 1,
            salt: [0xAA; SALT_SIZE],
            memory_cost: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }

    #[test]
    fn test_round_trip() {
        let header = sample();
        let bytes = header.serialize();
        assert_eq!(VaultHeader::deserialize(&bytes).unwrap(), header);
    }

    #[test]
    fn test_round_trip_extremes() {
        for value in [0u32, 1, 0x0102_0304, u32::MAX] {
            let header = VaultHeader {
                version: value,
                salt: [value as u8; SALT_SIZE],
                memory_cost: value,
                time_cost: value.rotate_left(8),
                parallelism: !value,
            };
            assert_eq!(VaultHeader::deserialize(&header.serialize()).unwrap(), header);
        }
    }

    #[test]
    fn test_little_endian_layout() {
        let header = sample();
        let bytes = header.serialize();

        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..20], &[0xAA; SALT_SIZE]);
        assert_eq!(&bytes[20..24], &[0x00, 0x00, 0x01, 0x00]);
        assert_eq!(&bytes[24..28], &[3, 0, 0, 0]);
        assert_eq!(&bytes[28..32], &[4, 0, 0, 0]);
    }

    #[test]
    fn test_wrong_length_is_format_error() {
        for len in [0usize, 31, 33, 64] {
            let result = VaultHeader::deserialize(&vec![0u8; len]);
            assert!(matches!(result, Err(Error::Format(_))), "len {}", len);
        }
    }

    #[test]
    fn test_generate_uses_params_and_random_salt() {
        let params = KdfParams {
            memory_cost: 2048,
            time_cost: 2,
            parallelism: 1,
        };
        let a = VaultHeader::generate(&params);
        let b = VaultHeader::generate(&params);

        assert_eq!(a.version, HEADER_VERSION);
        assert_eq!(a.kdf_params(), params);
        assert_ne!(a.salt, b.salt);
    }
}
