//! Record store contract
//!
//! The vault never talks to a database directly. It hands already-encrypted
//! rows to a [`RecordStore`] and reads them back. Secret fields arrive here
//! as base64 [`EncryptedBlob`](crate::crypto::EncryptedBlob) strings; only
//! the URL, ids, timestamps and flags are plaintext.
//!
//! The store is a synchronous critical section: one logical writer per
//! vault is assumed and the store does no multi-writer locking of its own.

mod memory;
mod sled;

pub use self::memory::MemoryRecordStore;
pub use self::sled::SledRecordStore;

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Metadata key holding the serialized vault header
pub const META_HEADER: &str = "header";

/// Metadata key holding the SHA-256 of the vault key
pub const META_KEY_HASH: &str = "key_hash";

/// Metadata key holding the device identity document
pub const META_IDENTITY: &str = "device_identity";

/// Stored form of a vault entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRow {
    pub id: String,
    pub title: String,
    pub username: String,
    pub password: String,
    pub notes: Option<String>,
    pub totp_secret: Option<String>,
    /// Plaintext so domain lookups need no decryption
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

/// Stored form of a folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderRow {
    pub id: String,
    /// Encrypted folder name
    pub name: String,
    pub parent_id: Option<String>,
    pub created_at: i64,
}

/// How far reconciliation has progressed with one remote device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub device_id: String,
    pub last_sync_time: i64,
    pub last_sync_version: u64,
}

impl SyncState {
    /// State for a peer we have never synced with
    pub fn new(device_id: impl Into<String>) -> Self {
        SyncState {
            device_id: device_id.into(),
            last_sync_time: 0,
            last_sync_version: 0,
        }
    }
}

/// One change to the local store, numbered by the vault sync version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Vault sync version this change produced (1-based, dense)
    pub version: u64,
    pub entry_id: String,
    /// `modifiedAt` of the entry after the change
    pub modified_at: i64,
    /// Set once a peer acknowledged a delta containing this change
    pub synced: bool,
}

/// Persistence collaborator for a single vault
pub trait RecordStore: Send + Sync {
    /// Read a metadata value
    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a metadata value
    fn put_meta(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Get an entry row by id (tombstones included)
    fn get_entry(&self, id: &str) -> Result<Option<EntryRow>>;

    /// Insert or replace an entry row
    fn put_entry(&self, row: &EntryRow) -> Result<()>;

    /// All entry rows, tombstones included. Rows the store cannot decode are
    /// skipped and logged rather than failing the scan.
    fn entries(&self) -> Result<Vec<EntryRow>>;

    /// Get a folder row by id
    fn get_folder(&self, id: &str) -> Result<Option<FolderRow>>;

    /// Insert or replace a folder row
    fn put_folder(&self, row: &FolderRow) -> Result<()>;

    /// All folder rows
    fn folders(&self) -> Result<Vec<FolderRow>>;

    /// Sync progress for one peer
    fn get_sync_state(&self, device_id: &str) -> Result<Option<SyncState>>;

    /// Record sync progress for one peer
    fn put_sync_state(&self, state: &SyncState) -> Result<()>;

    /// Sync progress for every known peer
    fn sync_states(&self) -> Result<Vec<SyncState>>;

    /// Append to the change log. `change.version` must be one above
    /// [`RecordStore::current_version`].
    fn append_change(&self, change: &ChangeRecord) -> Result<()>;

    /// A single change record
    fn get_change(&self, version: u64) -> Result<Option<ChangeRecord>>;

    /// Change records with a version strictly above `version`, ascending
    fn changes_since(&self, version: u64) -> Result<Vec<ChangeRecord>>;

    /// Highest change version, 0 for an empty log
    fn current_version(&self) -> Result<u64>;

    /// Mark every change up to and including `version` as synced.
    /// Returns how many records changed state.
    fn mark_synced(&self, version: u64) -> Result<usize>;

    /// Persist outstanding writes
    fn flush(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod contract_tests {
    //! Behaviour every [`RecordStore`] implementation must share

    use super::*;

    pub fn row(id: &str, modified_at: i64) -> EntryRow {
        EntryRow {
            id: id.to_string(),
            title: "dGl0bGU=".to_string(),
            username: "dXNlcg==".to_string(),
            password: "cGFzcw==".to_string(),
            notes: None,
            totp_secret: None,
            url: Some("https://example.com".to_string()),
            folder_id: None,
            created_at: modified_at,
            modified_at,
            last_used_at: None,
            deleted_at: None,
            sync_version: 0,
            is_deleted: false,
            is_favorite: false,
        }
    }

    pub fn exercise(store: &dyn RecordStore) {
        // metadata
        assert!(store.get_meta("missing").unwrap().is_none());
        store.put_meta("k", b"v").unwrap();
        assert_eq!(store.get_meta("k").unwrap().unwrap(), b"v");

        // entries
        store.put_entry(&row("a", 10)).unwrap();
        store.put_entry(&row("b", 20)).unwrap();
        let mut updated = row("a", 30);
        updated.sync_version = 1;
        store.put_entry(&updated).unwrap();
        assert_eq!(store.get_entry("a").unwrap().unwrap().sync_version, 1);
        assert_eq!(store.entries().unwrap().len(), 2);
        assert!(store.get_entry("zzz").unwrap().is_none());

        // folders
        let folder = FolderRow {
            id: "f1".to_string(),
            name: "bmFtZQ==".to_string(),
            parent_id: None,
            created_at: 5,
        };
        store.put_folder(&folder).unwrap();
        assert_eq!(store.get_folder("f1").unwrap().unwrap(), folder);
        assert_eq!(store.folders().unwrap().len(), 1);

        // sync states
        let mut state = SyncState::new("peer-1");
        state.last_sync_version = 7;
        store.put_sync_state(&state).unwrap();
        assert_eq!(store.get_sync_state("peer-1").unwrap().unwrap(), state);
        assert!(store.get_sync_state("peer-2").unwrap().is_none());
        assert_eq!(store.sync_states().unwrap().len(), 1);

        // change log
        assert_eq!(store.current_version().unwrap(), 0);
        for version in 1..=3 {
            store
                .append_change(&ChangeRecord {
                    version,
                    entry_id: "a".to_string(),
                    modified_at: version as i64 * 100,
                    synced: false,
                })
                .unwrap();
        }
        assert_eq!(store.current_version().unwrap(), 3);
        assert_eq!(store.get_change(2).unwrap().unwrap().modified_at, 200);
        let since: Vec<u64> = store
            .changes_since(1)
            .unwrap()
            .iter()
            .map(|c| c.version)
            .collect();
        assert_eq!(since, vec![2, 3]);

        assert_eq!(store.mark_synced(2).unwrap(), 2);
        assert_eq!(store.mark_synced(2).unwrap(), 0);
        assert!(store.get_change(1).unwrap().unwrap().synced);
        assert!(!store.get_change(3).unwrap().unwrap().synced);

        store.flush().unwrap();
    }
}
