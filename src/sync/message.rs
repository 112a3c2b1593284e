//! Sync wire messages
//!
//! Frames carry a loose JSON envelope `{type, payload, timestamp}`. It is
//! turned into a [`SyncMessage`] at the boundary; anything that does not
//! validate is a format error and never reaches the engine.

use crate::error::{Error, Result};
use crate::vault::now_ms;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SYNC_REQUEST: &str = "sync-request";
pub const SYNC_RESPONSE: &str = "sync-response";
pub const SYNC_ACK: &str = "sync-ack";
pub const SYNC_ERROR: &str = "sync-error";

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: i64,
}

/// Ask a peer for everything after `from_version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_id: String,
    pub from_version: u64,
    /// Sender's own vault version, so the peer can tell it is behind
    pub my_version: u64,
}

/// A sealed delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub device_id: String,
    pub from_version: u64,
    pub to_version: u64,
    pub entry_count: usize,
    /// Entries JSON sealed with the sync key, device id as associated data
    pub sealed: String,
}

/// Receipt for an applied delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAck {
    pub device_id: String,
    pub received_version: u64,
    pub merged_count: usize,
    pub conflict_count: usize,
}

/// Peer-reported failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    pub device_id: String,
    pub message: String,
}

/// Every message the sync protocol exchanges
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    Request(SyncRequest),
    Response(SyncResponse),
    Ack(SyncAck),
    Error(SyncError),
}

impl SyncMessage {
    /// Wire type string
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Request(_) => SYNC_REQUEST,
            SyncMessage::Response(_) => SYNC_RESPONSE,
            SyncMessage::Ack(_) => SYNC_ACK,
            SyncMessage::Error(_) => SYNC_ERROR,
        }
    }

    /// Device that sent the message
    pub fn device_id(&self) -> &str {
        match self {
            SyncMessage::Request(m) => &m.device_id,
            SyncMessage::Response(m) => &m.device_id,
            SyncMessage::Ack(m) => &m.device_id,
            SyncMessage::Error(m) => &m.device_id,
        }
    }

    /// Wrap in an envelope stamped with the current time
    pub fn to_envelope(&self) -> Result<Envelope> {
        let payload = match self {
            SyncMessage::Request(m) => serde_json::to_value(m)?,
            SyncMessage::Response(m) => serde_json::to_value(m)?,
            SyncMessage::Ack(m) => serde_json::to_value(m)?,
            SyncMessage::Error(m) => serde_json::to_value(m)?,
        };
        Ok(Envelope {
            kind: self.kind().to_string(),
            payload,
            timestamp: now_ms(),
        })
    }

    /// Validate an envelope
    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        match envelope.kind.as_str() {
            SYNC_REQUEST => Ok(SyncMessage::Request(payload(envelope)?)),
            SYNC_RESPONSE => Ok(SyncMessage::Response(payload(envelope)?)),
            SYNC_ACK => Ok(SyncMessage::Ack(payload(envelope)?)),
            SYNC_ERROR => Ok(SyncMessage::Error(payload(envelope)?)),
            other => Err(Error::Format(format!("unknown message type '{}'", other))),
        }
    }

    /// Serialize straight to envelope JSON text
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_envelope()?)?)
    }

    /// Parse envelope JSON text and validate it
    pub fn from_json(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| Error::Format(format!("malformed envelope: {}", e)))?;
        Self::from_envelope(envelope)
    }
}

fn payload<T: DeserializeOwned>(envelope: Envelope) -> Result<T> {
    let kind = envelope.kind;
    serde_json::from_value(envelope.payload)
        .map_err(|e| Error::Format(format!("invalid {} payload: {}", kind, e)))
}
