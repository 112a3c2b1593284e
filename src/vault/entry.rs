//! Plaintext entry and folder models
//!
//! These are what callers see once a row has been decrypted. Conversion
//! to and from the stored [`EntryRow`] form lives here so the session only
//! deals with whole entries.

use crate::crypto::{decrypt_from_string, encrypt_to_string, KEY_SIZE};
use crate::error::{Error, Result};
use crate::store::{EntryRow, FolderRow};
use crate::sync::RecordStamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// A decrypted credential
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultEntry {
    pub id: String,
    pub title: String,
    pub username: String,
    pub password: String,
    pub notes: Option<String>,
    pub totp_secret: Option<String>,
    pub url: Option<String>,
    pub folder_id: Option<String>,
    pub created_at: i64,
    pub modified_at: i64,
    pub last_used_at: Option<i64>,
    pub deleted_at: Option<i64>,
    pub sync_version: u64,
    pub is_deleted: bool,
    pub is_favorite: bool,
}

impl VaultEntry {
    /// Stamp used for last-write-wins comparison
    pub fn stamp(&self) -> RecordStamp {
        RecordStamp {
            modified_at: self.modified_at,
            sync_version: self.sync_version,
        }
    }

    /// Encrypt every secret field under `key`
    pub(crate) fn seal(&self, key: &[u8; KEY_SIZE]) -> Result<EntryRow> {
        let seal = |field: &str, value: &str| {
            encrypt_to_string(key, value, field_aad(&self.id, field).as_bytes())
        };
        let seal_opt = |field: &str, value: &Option<String>| -> Result<Option<String>> {
            value.as_deref().map(|v| seal(field, v)).transpose()
        };

        Ok(EntryRow {
            id: self.id.clone(),
            title: seal("title", &self.title)?,
            username: seal("username", &self.username)?,
            password: seal("password", &self.password)?,
            notes: seal_opt("notes", &self.notes)?,
            totp_secret: seal_opt("totpSecret", &self.totp_secret)?,
            url: self.url.clone(),
            folder_id: self.folder_id.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
            last_used_at: self.last_used_at,
            deleted_at: self.deleted_at,
            sync_version: self.sync_version,
            is_deleted: self.is_deleted,
            is_favorite: self.is_favorite,
        })
    }

    /// Decrypt a stored row. Any field failing authentication fails the
    /// whole entry with [`Error::EntryDecryption`].
    pub(crate) fn open(row: &EntryRow, key: &[u8; KEY_SIZE]) -> Result<Self> {
        let open = |field: &str, value: &str| {
            decrypt_from_string(key, value, field_aad(&row.id, field).as_bytes()).map_err(|e| {
                Error::EntryDecryption {
                    id: row.id.clone(),
                    reason: format!("{}: {}", field, e),
                }
            })
        };
        let open_opt = |field: &str, value: &Option<String>| -> Result<Option<String>> {
            value.as_deref().map(|v| open(field, v)).transpose()
        };

        Ok(VaultEntry {
            id: row.id.clone(),
            title: open("title", &row.title)?,
            username: open("username", &row.username)?,
            password: open("password", &row.password)?,
            notes: open_opt("notes", &row.notes)?,
            totp_secret: open_opt("totpSecret", &row.totp_secret)?,
            url: row.url.clone(),
            folder_id: row.folder_id.clone(),
            created_at: row.created_at,
            modified_at: row.modified_at,
            last_used_at: row.last_used_at,
            deleted_at: row.deleted_at,
            sync_version: row.sync_version,
            is_deleted: row.is_deleted,
            is_favorite: row.is_favorite,
        })
    }
}

impl fmt::Debug for VaultEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultEntry")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("url", &self.url)
            .field("modified_at", &self.modified_at)
            .field("sync_version", &self.sync_version)
            .field("is_deleted", &self.is_deleted)
            .finish()
    }
}

/// Fields for a new entry
#[derive(Clone, Default)]
pub struct NewEntry {
    pub title: String,
    pub username: String,
    pub password: String,
    pub notes: Option<String>,
    pub totp_secret: Option<String>,
    pub url: Option<String>,
    pub folder_id: Option<String>,
}

/// Partial update; `None` leaves a field as it is. The nested options on
/// optional fields allow clearing them with `Some(None)`.
#[derive(Clone, Default)]
pub struct EntryUpdate {
    pub title: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub notes: Option<Option<String>>,
    pub totp_secret: Option<Option<String>>,
    pub url: Option<Option<String>>,
    pub folder_id: Option<Option<String>>,
}

impl EntryUpdate {
    /// Whether the update touches anything
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.username.is_none()
            && self.password.is_none()
            && self.notes.is_none()
            && self.totp_secret.is_none()
            && self.url.is_none()
            && self.folder_id.is_none()
    }
}

/// A decrypted folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultFolder {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub created_at: i64,
}

impl VaultFolder {
    pub(crate) fn seal(&self, key: &[u8; KEY_SIZE]) -> Result<FolderRow> {
        Ok(FolderRow {
            id: self.id.clone(),
            name: encrypt_to_string(key, &self.name, field_aad(&self.id, "name").as_bytes())?,
            parent_id: self.parent_id.clone(),
            created_at: self.created_at,
        })
    }

    pub(crate) fn open(row: &FolderRow, key: &[u8; KEY_SIZE]) -> Result<Self> {
        Ok(VaultFolder {
            id: row.id.clone(),
            name: decrypt_from_string(key, &row.name, field_aad(&row.id, "name").as_bytes())?,
            parent_id: row.parent_id.clone(),
            created_at: row.created_at,
        })
    }
}

/// Associated data binding a ciphertext to its record and field
pub(crate) fn field_aad(id: &str, field: &str) -> String {
    format!("{}:{}", id, field)
}

/// Lower-cased host of a URL with any leading `www.` removed.
///
/// Bare hosts such as `example.com/login` are accepted.
pub fn normalize_host(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed = Url::parse(trimmed)
        .ok()
        .filter(|u| u.host_str().is_some())
        .or_else(|| Url::parse(&format!("https://{}", trimmed)).ok())?;

    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Whether an entry URL belongs to the same site as `query`
pub fn domain_matches(entry_url: &str, query: &str) -> bool {
    match (normalize_host(entry_url), normalize_host(query)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
