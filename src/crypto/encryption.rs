//! AES-256-GCM Encryption Implementation
//!
//! Every field stored in the vault goes through here. The codec:
//! - draws a fresh 96-bit nonce from the CSPRNG on every call (callers can
//!   never supply one)
//! - authenticates optional associated data alongside the ciphertext
//! - never returns plaintext when the tag fails to verify

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};

/// Encrypted payload laid out as `nonce || tag || ciphertext`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    /// Nonce used for encryption (unique per encryption)
    pub nonce: [u8; NONCE_SIZE],
    /// GCM authentication tag
    pub tag: [u8; TAG_SIZE],
    /// Ciphertext, same length as the plaintext
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Minimum packed size (empty plaintext)
    pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

    /// Get the total packed size
    pub fn size(&self) -> usize {
        Self::OVERHEAD + self.ciphertext.len()
    }

    /// Pack into `nonce || tag || ciphertext`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.tag);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Unpack from `nonce || tag || ciphertext`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::OVERHEAD {
            return Err(Error::Format(format!(
                "encrypted blob too short: {} bytes",
                bytes.len()
            )));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&bytes[NONCE_SIZE..Self::OVERHEAD]);

        Ok(EncryptedBlob {
            nonce,
            tag,
            ciphertext: bytes[Self::OVERHEAD..].to_vec(),
        })
    }

    /// Base64 text form for text-oriented columns and JSON
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// Parse the base64 text form
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64.decode(encoded)?;
        Self::from_bytes(&bytes)
    }
}

fn aead_key(key: &[u8; KEY_SIZE]) -> Result<LessSafeKey> {
    let unbound_key = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Encryption("Failed to create AES-256-GCM key".to_string()))?;
    Ok(LessSafeKey::new(unbound_key))
}

/// Encrypt data using AES-256-GCM
///
/// # Arguments
/// * `key` - 256-bit encryption key
/// * `plaintext` - Data to encrypt
/// * `aad` - Associated data (authenticated but not encrypted, may be empty)
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<EncryptedBlob> {
    let sealing_key = aead_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    let tag = sealing_key
        .seal_in_place_separate_tag(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| Error::Encryption("Encryption failed".to_string()))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_ref());

    Ok(EncryptedBlob {
        nonce: nonce_bytes,
        tag: tag_bytes,
        ciphertext: in_out,
    })
}

/// Decrypt data using AES-256-GCM
///
/// Fails with [`Error::Authentication`] when the key, ciphertext, tag or
/// associated data do not match what was sealed.
pub fn decrypt(key: &[u8; KEY_SIZE], blob: &EncryptedBlob, aad: &[u8]) -> Result<Vec<u8>> {
    let opening_key = aead_key(key)?;
    let nonce = Nonce::assume_unique_for_key(blob.nonce);

    // ring expects ciphertext || tag
    let mut in_out = Vec::with_capacity(blob.ciphertext.len() + TAG_SIZE);
    in_out.extend_from_slice(&blob.ciphertext);
    in_out.extend_from_slice(&blob.tag);

    let plaintext = opening_key
        .open_in_place(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| Error::Authentication)?;

    Ok(plaintext.to_vec())
}

/// Encrypt a UTF-8 string into base64(`nonce || tag || ciphertext`)
pub fn encrypt_to_string(key: &[u8; KEY_SIZE], plaintext: &str, aad: &[u8]) -> Result<String> {
    Ok(encrypt(key, plaintext.as_bytes(), aad)?.to_base64())
}

/// Reverse of [`encrypt_to_string`]
pub fn decrypt_from_string(key: &[u8; KEY_SIZE], encoded: &str, aad: &[u8]) -> Result<String> {
    let blob = EncryptedBlob::from_base64(encoded)?;
    let plaintext = decrypt(key, &blob, aad)?;
    String::from_utf8(plaintext)
        .map_err(|_| Error::Format("decrypted field is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = test_key();
        let plaintext = b"Hello, lanvault!";

        let blob = encrypt(&key, plaintext, &[]).unwrap();
        let decrypted = decrypt(&key, &blob, &[]).unwrap();

        assert_eq!(decrypted, plaintext);
        assert_eq!(blob.ciphertext.len(), plaintext.len());
    }

    #[test]
    fn test_encrypt_decrypt_with_aad() {
        let key = test_key();
        let aad = b"entry:1234";

        let blob = encrypt(&key, b"Secret data", aad).unwrap();
        assert_eq!(decrypt(&key, &blob, aad).unwrap(), b"Secret data");
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = test_key();
        let blob = encrypt(&key, b"Secret data", b"entry:1234").unwrap();
        let result = decrypt(&key, &blob, b"entry:5678");
        assert!(matches!(result, Err(Error::Authentication)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = encrypt(&test_key(), b"Secret data", &[]).unwrap();
        let result = decrypt(&test_key(), &blob, &[]);
        assert!(matches!(result, Err(Error::Authentication)));
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = test_key();
        let a = encrypt(&key, b"same", &[]).unwrap();
        let b = encrypt(&key, b"same", &[]).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_every_bit_flip_detected() {
        let key = test_key();
        let blob = encrypt(&key, b"correct horse battery staple", &[]).unwrap();
        let packed = blob.to_bytes();

        // Flip each bit of the tag and ciphertext (everything after the nonce)
        for byte in NONCE_SIZE..packed.len() {
            for bit in 0..8 {
                let mut tampered = packed.clone();
                tampered[byte] ^= 1 << bit;
                let tampered = EncryptedBlob::from_bytes(&tampered).unwrap();
                assert!(
                    matches!(decrypt(&key, &tampered, &[]), Err(Error::Authentication)),
                    "flip at byte {} bit {} went undetected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let key = test_key();
        let mut blob = encrypt(&key, b"payload", &[]).unwrap();
        blob.nonce[0] ^= 0x01;
        assert!(matches!(decrypt(&key, &blob, &[]), Err(Error::Authentication)));
    }

    #[test]
    fn test_empty_plaintext() {
        let key = test_key();
        let blob = encrypt(&key, b"", &[]).unwrap();
        assert_eq!(blob.size(), EncryptedBlob::OVERHEAD);
        assert_eq!(decrypt(&key, &blob, &[]).unwrap(), b"");
    }

    #[test]
    fn test_large_plaintext() {
        let key = test_key();
        let plaintext = vec![0x42u8; 1024 * 1024];

        let blob = encrypt(&key, &plaintext, &[]).unwrap();
        assert_eq!(decrypt(&key, &blob, &[]).unwrap(), plaintext);
    }

    #[test]
    fn test_packed_layout() {
        let key = test_key();
        let blob = encrypt(&key, b"abc", &[]).unwrap();
        let bytes = blob.to_bytes();

        assert_eq!(bytes.len(), NONCE_SIZE + TAG_SIZE + 3);
        assert_eq!(&bytes[..NONCE_SIZE], &blob.nonce);
        assert_eq!(&bytes[NONCE_SIZE..NONCE_SIZE + TAG_SIZE], &blob.tag);
        assert_eq!(EncryptedBlob::from_bytes(&bytes).unwrap(), blob);
    }

    #[test]
    fn test_short_blob_is_format_error() {
        let result = EncryptedBlob::from_bytes(&[0u8; EncryptedBlob::OVERHEAD - 1]);
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn test_string_round_trip_utf8() {
        let key = test_key();
        for text in ["", "plain ascii", "pässwörd ✓ 🔐", "line\nbreaks\tand tabs"] {
            let encoded = encrypt_to_string(&key, text, &[]).unwrap();
            assert_eq!(decrypt_from_string(&key, &encoded, &[]).unwrap(), text);
        }
    }

    #[test]
    fn test_invalid_base64_is_format_error() {
        let key = test_key();
        let result = decrypt_from_string(&key, "not base64 !!!", &[]);
        assert!(matches!(result, Err(Error::Format(_))));
    }
}
