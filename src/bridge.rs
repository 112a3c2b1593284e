//! Messaging bridge
//!
//! Browser-side helpers talk to the vault with little-endian length-prefixed
//! JSON frames. Every request gets exactly one response whose type is the
//! request type suffixed with `Result`; failures set `error` instead of
//! closing the stream.

use crate::error::{Error, Result};
use crate::sync::FrameCodec;
use crate::vault::{normalize_host, EntryUpdate, NewEntry, Vault, VaultEntry};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

pub const IS_UNLOCKED: &str = "isUnlocked";
pub const GET_CREDENTIALS: &str = "getCredentials";
pub const FILL_CREDENTIALS: &str = "fillCredentials";
pub const SAVE_CREDENTIALS: &str = "saveCredentials";

/// Incoming request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

/// Outgoing response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeResponse {
    fn success(request: &BridgeRequest, payload: Value) -> Self {
        BridgeResponse {
            kind: format!("{}Result", request.kind),
            payload: Some(payload),
            request_id: request.request_id.clone(),
            error: None,
        }
    }

    fn failure(request: &BridgeRequest, error: impl Into<String>) -> Self {
        BridgeResponse {
            kind: format!("{}Result", request.kind),
            payload: None,
            request_id: request.request_id.clone(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UrlParams {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillParams {
    entry_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveParams {
    title: Option<String>,
    username: String,
    password: String,
    site_url: String,
}

/// Credential summary sent to the page; never carries the password
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialSummary<'a> {
    id: &'a str,
    title: &'a str,
    username: &'a str,
    url: Option<&'a str>,
    is_favorite: bool,
}

impl<'a> From<&'a VaultEntry> for CredentialSummary<'a> {
    fn from(entry: &'a VaultEntry) -> Self {
        CredentialSummary {
            id: &entry.id,
            title: &entry.title,
            username: &entry.username,
            url: entry.url.as_deref(),
            is_favorite: entry.is_favorite,
        }
    }
}

/// Dispatches bridge requests against one vault
pub struct Bridge {
    vault: Arc<Vault>,
}

impl Bridge {
    pub fn new(vault: Arc<Vault>) -> Self {
        Bridge { vault }
    }

    /// Answer one request
    pub fn handle(&self, request: &BridgeRequest) -> BridgeResponse {
        if request.kind == IS_UNLOCKED {
            return BridgeResponse::success(request, json!({ "unlocked": self.vault.is_unlocked() }));
        }

        let result = match request.kind.as_str() {
            GET_CREDENTIALS => params(request).and_then(|p| self.get_credentials(p)),
            FILL_CREDENTIALS => params(request).and_then(|p| self.fill_credentials(p)),
            SAVE_CREDENTIALS => params(request).and_then(|p| self.save_credentials(p)),
            other => {
                warn!("Unknown bridge request type '{}'", other);
                return BridgeResponse::failure(request, format!("unknown request type '{}'", other));
            }
        };

        match result {
            Ok(payload) => BridgeResponse::success(request, payload),
            Err(e) => {
                debug!("Bridge request {} failed: {}", request.kind, e);
                BridgeResponse::failure(request, e.to_string())
            }
        }
    }

    fn get_credentials(&self, params: UrlParams) -> Result<Value> {
        let matches = self.vault.find_entries_by_domain(&params.url)?;
        let credentials: Vec<CredentialSummary<'_>> = matches.iter().map(Into::into).collect();
        Ok(json!({ "credentials": credentials }))
    }

    fn fill_credentials(&self, params: FillParams) -> Result<Value> {
        let entry = self.vault.mark_used(&params.entry_id)?;
        Ok(json!({
            "id": entry.id,
            "username": entry.username,
            "password": entry.password,
        }))
    }

    /// Save a login seen on a page. A live entry for the same site and
    /// username gets its password replaced; otherwise a new entry is added.
    fn save_credentials(&self, params: SaveParams) -> Result<Value> {
        let host = normalize_host(&params.site_url)
            .ok_or_else(|| Error::Format(format!("invalid site url '{}'", params.site_url)))?;

        let existing = self
            .vault
            .find_entries_by_domain(&params.site_url)?
            .into_iter()
            .find(|entry| entry.username == params.username);

        let (entry, updated) = match existing {
            Some(entry) => {
                let update = EntryUpdate {
                    password: Some(params.password),
                    ..EntryUpdate::default()
                };
                (self.vault.update_entry(&entry.id, update)?, true)
            }
            None => {
                let entry = self.vault.add_entry(NewEntry {
                    title: params.title.unwrap_or_else(|| host.clone()),
                    username: params.username,
                    password: params.password,
                    url: Some(params.site_url),
                    ..NewEntry::default()
                })?;
                (entry, false)
            }
        };

        info!("Saved credentials for {} as entry {}", host, entry.id);
        Ok(json!({ "id": entry.id, "updated": updated }))
    }

    /// Serve requests from `reader` until it closes, writing responses to
    /// `writer`
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut requests = FramedRead::new(reader, FrameCodec::<Value>::bridge().tolerant());
        let mut responses = FramedWrite::new(writer, FrameCodec::<BridgeResponse>::bridge());

        while let Some(frame) = requests.next().await {
            let parsed = frame?.and_then(|value| {
                serde_json::from_value::<BridgeRequest>(value).map_err(|e| Error::Format(e.to_string()))
            });
            let response = match parsed {
                Ok(request) => self.handle(&request),
                Err(e) => {
                    warn!("Rejecting bridge frame: {}", e);
                    BridgeResponse {
                        kind: "error".to_string(),
                        payload: None,
                        request_id: None,
                        error: Some(format!("malformed request: {}", e)),
                    }
                }
            };
            responses.send(response).await?;
        }
        debug!("Bridge input closed");
        Ok(())
    }
}

fn params<T: DeserializeOwned>(request: &BridgeRequest) -> Result<T> {
    let payload = request.payload.clone().unwrap_or(Value::Null);
    serde_json::from_value(payload)
        .map_err(|e| Error::Format(format!("invalid {} payload: {}", request.kind, e)))
}
