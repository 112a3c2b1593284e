//! Device identity
//!
//! Every installation has a stable device id and an Ed25519 key pair. The
//! id names the device in discovery and sync messages; the key signs
//! discovery announcements so peers can tell a device from an impostor
//! reusing its id.

use crate::error::{Error, Result};
use crate::store::{RecordStore, META_IDENTITY};
use ring::rand::SecureRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use zeroize::Zeroizing;

/// Length of a derived device id in hex characters
pub const DEVICE_ID_LEN: usize = 16;

/// Length of the public key prefix advertised in discovery TXT records
pub const PK_PREFIX_LEN: usize = 16;

/// Persistent identity of this device
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Stable device id
    pub device_id: String,

    /// Human-readable device name
    pub name: String,

    /// Ed25519 public key
    #[serde(with = "hex_key")]
    pub public_key: [u8; 32],

    /// Ed25519 seed
    #[serde(with = "hex_seed")]
    seed: Zeroizing<[u8; 32]>,

    /// Random nonce mixed into the derived device id
    install_nonce: String,
}

impl DeviceIdentity {
    /// Generate a fresh identity. Without an override the device id is
    /// derived from the hostname and a random installation nonce.
    pub fn generate(name: String, device_id: Option<String>) -> Result<Self> {
        let rng = ring::rand::SystemRandom::new();

        let mut seed = Zeroizing::new([0u8; 32]);
        rng.fill(&mut seed[..])
            .map_err(|_| Error::KeyDerivation("Failed to generate random seed".to_string()))?;

        let mut nonce = [0u8; 16];
        rng.fill(&mut nonce)
            .map_err(|_| Error::KeyDerivation("Failed to generate install nonce".to_string()))?;
        let install_nonce = hex::encode(nonce);

        let key_pair = key_pair_from_seed(&seed)?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(key_pair.public_key().as_ref());

        let device_id = device_id.unwrap_or_else(|| derive_device_id(&host_name(), &install_nonce));

        Ok(DeviceIdentity {
            device_id,
            name,
            public_key,
            seed,
            install_nonce,
        })
    }

    /// Load the identity kept in `store`, creating it on first use. A
    /// configured name or id override replaces the stored one.
    pub fn load_or_create(
        store: &dyn RecordStore,
        name: &str,
        device_id: Option<&str>,
    ) -> Result<Self> {
        let mut identity = match store.get_meta(META_IDENTITY)? {
            Some(bytes) => Self::from_bytes(&bytes)?,
            None => {
                let identity = Self::generate(name.to_string(), device_id.map(str::to_string))?;
                info!(
                    "Generated device identity {} ({})",
                    identity.device_id, identity.name
                );
                store.put_meta(META_IDENTITY, &identity.to_bytes()?)?;
                return Ok(identity);
            }
        };

        let mut changed = false;
        if identity.name != name {
            identity.name = name.to_string();
            changed = true;
        }
        if let Some(id) = device_id {
            if identity.device_id != id {
                identity.device_id = id.to_string();
                changed = true;
            }
        }
        if changed {
            store.put_meta(META_IDENTITY, &identity.to_bytes()?)?;
        }
        Ok(identity)
    }

    fn key_pair(&self) -> Result<Ed25519KeyPair> {
        key_pair_from_seed(&self.seed)
    }

    /// Sign data with this device's private key
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.key_pair()?.sign(data).as_ref().to_vec())
    }

    /// Hex-encoded public key
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    /// Public key prefix advertised as `pk`
    pub fn public_key_prefix(&self) -> String {
        self.public_key_hex()[..PK_PREFIX_LEN].to_string()
    }

    /// Serialize to bytes for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("name", &self.name)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Check an Ed25519 signature against a raw public key
pub fn verify_signature(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(data, signature)
        .is_ok()
}

/// BLAKE3 of the host name and install nonce, truncated to 16 hex chars
pub fn derive_device_id(host: &str, install_nonce: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(host.as_bytes());
    hasher.update(b":");
    hasher.update(install_nonce.as_bytes());
    hasher.finalize().to_hex()[..DEVICE_ID_LEN].to_string()
}

/// This machine's host name, or "localhost" when it cannot be read
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn key_pair_from_seed(seed: &[u8; 32]) -> Result<Ed25519KeyPair> {
    Ed25519KeyPair::from_seed_unchecked(seed)
        .map_err(|_| Error::KeyDerivation("Failed to create Ed25519 key pair".to_string()))
}

fn decode_32<E: serde::de::Error>(text: &str) -> std::result::Result<[u8; 32], E> {
    let bytes = hex::decode(text).map_err(E::custom)?;
    if bytes.len() != 32 {
        return Err(E::custom("invalid key length"));
    }
    let mut array = [0u8; 32];
    array.copy_from_slice(&bytes);
    Ok(array)
}

// Hex serde for the public key
mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        super::decode_32(&text)
    }
}

// Hex serde for the private seed
mod hex_seed {
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S>(seed: &Zeroizing<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = Zeroizing::new(hex::encode(&seed[..]));
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Zeroizing<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = Zeroizing::new(String::deserialize(deserializer)?);
        Ok(Zeroizing::new(super::decode_32(&text)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;

    #[test]
    fn test_generate_identity() {
        let identity = DeviceIdentity::generate("laptop".to_string(), None).unwrap();
        assert_eq!(identity.device_id.len(), DEVICE_ID_LEN);
        assert_eq!(identity.public_key_prefix().len(), PK_PREFIX_LEN);
        assert!(identity.public_key_hex().starts_with(&identity.public_key_prefix()));
    }

    #[test]
    fn test_device_id_override() {
        let identity =
            DeviceIdentity::generate("desk".to_string(), Some("fixed-id".to_string())).unwrap();
        assert_eq!(identity.device_id, "fixed-id");
    }

    #[test]
    fn test_derive_device_id_is_stable() {
        let a = derive_device_id("host", "nonce");
        assert_eq!(a, derive_device_id("host", "nonce"));
        assert_ne!(a, derive_device_id("host", "other"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = DeviceIdentity::generate("phone".to_string(), None).unwrap();
        let signature = identity.sign(b"announce").unwrap();

        assert!(verify_signature(&identity.public_key, b"announce", &signature));
        assert!(!verify_signature(&identity.public_key, b"tampered", &signature));

        let other = DeviceIdentity::generate("other".to_string(), None).unwrap();
        assert!(!verify_signature(&other.public_key, b"announce", &signature));
    }

    #[test]
    fn test_serialization_round_trip() {
        let identity = DeviceIdentity::generate("tablet".to_string(), None).unwrap();
        let restored = DeviceIdentity::from_bytes(&identity.to_bytes().unwrap()).unwrap();

        assert_eq!(restored.device_id, identity.device_id);
        assert_eq!(restored.public_key, identity.public_key);
        // Restored key still signs for the same public key
        let signature = restored.sign(b"data").unwrap();
        assert!(verify_signature(&identity.public_key, b"data", &signature));
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let store = MemoryRecordStore::new();
        let first = DeviceIdentity::load_or_create(&store, "laptop", None).unwrap();
        let second = DeviceIdentity::load_or_create(&store, "laptop", None).unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.public_key, second.public_key);

        let renamed = DeviceIdentity::load_or_create(&store, "work laptop", None).unwrap();
        assert_eq!(renamed.name, "work laptop");
        assert_eq!(renamed.device_id, first.device_id);
    }

    #[test]
    fn test_debug_omits_seed() {
        let identity = DeviceIdentity::generate("x".to_string(), None).unwrap();
        let text = format!("{:?}", identity);
        assert!(!text.contains("seed"));
    }
}
