//! Error types for lanvault

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for lanvault
#[derive(Error, Debug)]
pub enum Error {
    // Crypto errors
    #[error("Authentication failed: data corrupted, tampered with, or wrong key")]
    Authentication,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Key derivation ran out of memory")]
    KdfOutOfMemory,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    // Session errors
    #[error("Invalid password")]
    InvalidPassword,

    #[error("Vault is locked")]
    VaultLocked,

    #[error("Vault already exists at {0}")]
    VaultExists(String),

    #[error("No vault found at {0}")]
    VaultNotFound(String),

    // Format errors
    #[error("Format error: {0}")]
    Format(String),

    // Record errors
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Entry is deleted: {0}")]
    EntryDeleted(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Decryption failed for entry {id}: {reason}")]
    EntryDecryption { id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    // Sync errors
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Sync already in progress with {0}")]
    SyncInProgress(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failed operation may succeed on a later attempt
    /// (the next auto-sync tick, a reconnect).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PeerUnreachable(_)
                | Error::Timeout(_)
                | Error::SyncInProgress(_)
                | Error::WebSocket(_)
                | Error::Io(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Format(format!("invalid base64: {}", e))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("peer".to_string()).is_retryable());
        assert!(Error::PeerUnreachable("10.0.0.2:47321".to_string()).is_retryable());
        assert!(Error::SyncInProgress("device-b".to_string()).is_retryable());
        assert!(!Error::Authentication.is_retryable());
        assert!(!Error::InvalidPassword.is_retryable());
        assert!(!Error::Format("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_invalid_password_message_is_generic() {
        let msg = Error::InvalidPassword.to_string();
        assert_eq!(msg, "Invalid password");
    }
}
