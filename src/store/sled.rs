//! Sled-backed record store
//!
//! One sled database per vault with a tree per row kind. Entry and folder
//! rows are stored as JSON so their on-disk form matches what export and
//! sync carry; sync bookkeeping uses bincode. Change log keys are big-endian
//! versions so tree order is version order.

use crate::error::Result;
use crate::store::{ChangeRecord, EntryRow, FolderRow, RecordStore, SyncState};
use ::sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info, warn};

/// Tree names
const META_TREE: &str = "meta";
const ENTRIES_TREE: &str = "entries";
const FOLDERS_TREE: &str = "folders";
const SYNC_STATE_TREE: &str = "sync_state";
const CHANGES_TREE: &str = "changes";

/// Record store using sled
pub struct SledRecordStore {
    /// Sled database
    db: Db,
    /// Header, key hash, device identity
    meta: Tree,
    /// Entry rows keyed by id
    entries: Tree,
    /// Folder rows keyed by id
    folders: Tree,
    /// Per-peer sync progress keyed by device id
    sync_state: Tree,
    /// Change log keyed by big-endian version
    changes: Tree,
}

impl SledRecordStore {
    /// Open or create a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = ::sled::open(path.as_ref())?;
        let store = Self::from_db(db)?;
        info!(
            "Record store opened at {:?}, {} entries, version {}",
            path.as_ref(),
            store.entries.len(),
            store.current_version()?
        );
        Ok(store)
    }

    /// Create a temporary store (for testing)
    pub fn temporary() -> Result<Self> {
        let db = ::sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(SledRecordStore {
            meta: db.open_tree(META_TREE)?,
            entries: db.open_tree(ENTRIES_TREE)?,
            folders: db.open_tree(FOLDERS_TREE)?,
            sync_state: db.open_tree(SYNC_STATE_TREE)?,
            changes: db.open_tree(CHANGES_TREE)?,
            db,
        })
    }

    fn version_key(version: u64) -> [u8; 8] {
        version.to_be_bytes()
    }
}

impl RecordStore for SledRecordStore {
    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.meta.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn put_meta(&self, key: &str, value: &[u8]) -> Result<()> {
        self.meta.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn get_entry(&self, id: &str) -> Result<Option<EntryRow>> {
        match self.entries.get(id.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn put_entry(&self, row: &EntryRow) -> Result<()> {
        let data = serde_json::to_vec(row)?;
        self.entries.insert(row.id.as_bytes(), data)?;
        debug!("Saved entry {} (version {})", row.id, row.sync_version);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<EntryRow>> {
        let mut rows = Vec::with_capacity(self.entries.len());
        for result in self.entries.iter() {
            let (key, data) = result?;
            match serde_json::from_slice::<EntryRow>(&data) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(
                    "Skipping undecodable entry row {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(rows)
    }

    fn get_folder(&self, id: &str) -> Result<Option<FolderRow>> {
        match self.folders.get(id.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn put_folder(&self, row: &FolderRow) -> Result<()> {
        let data = serde_json::to_vec(row)?;
        self.folders.insert(row.id.as_bytes(), data)?;
        Ok(())
    }

    fn folders(&self) -> Result<Vec<FolderRow>> {
        let mut rows = Vec::with_capacity(self.folders.len());
        for result in self.folders.iter() {
            let (key, data) = result?;
            match serde_json::from_slice::<FolderRow>(&data) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(
                    "Skipping undecodable folder row {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(rows)
    }

    fn get_sync_state(&self, device_id: &str) -> Result<Option<SyncState>> {
        match self.sync_state.get(device_id.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn put_sync_state(&self, state: &SyncState) -> Result<()> {
        let data = bincode::serialize(state)?;
        self.sync_state.insert(state.device_id.as_bytes(), data)?;
        Ok(())
    }

    fn sync_states(&self) -> Result<Vec<SyncState>> {
        self.sync_state
            .iter()
            .values()
            .map(|value| -> Result<SyncState> { Ok(bincode::deserialize(&value?)?) })
            .collect()
    }

    fn append_change(&self, change: &ChangeRecord) -> Result<()> {
        let data = bincode::serialize(change)?;
        self.changes
            .insert(Self::version_key(change.version), data)?;
        Ok(())
    }

    fn get_change(&self, version: u64) -> Result<Option<ChangeRecord>> {
        match self.changes.get(Self::version_key(version))? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn changes_since(&self, version: u64) -> Result<Vec<ChangeRecord>> {
        if version == u64::MAX {
            return Ok(Vec::new());
        }
        self.changes
            .range(Self::version_key(version + 1)..)
            .values()
            .map(|value| -> Result<ChangeRecord> { Ok(bincode::deserialize(&value?)?) })
            .collect()
    }

    fn current_version(&self) -> Result<u64> {
        match self.changes.last()? {
            Some((key, _)) if key.len() == 8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&key);
                Ok(u64::from_be_bytes(bytes))
            }
            _ => Ok(0),
        }
    }

    fn mark_synced(&self, version: u64) -> Result<usize> {
        let mut marked = 0;
        for result in self.changes.range(..=Self::version_key(version)) {
            let (key, data) = result?;
            let mut change: ChangeRecord = bincode::deserialize(&data)?;
            if !change.synced {
                change.synced = true;
                self.changes.insert(key, bincode::serialize(&change)?)?;
                marked += 1;
            }
        }
        debug!("Marked {} changes synced up to version {}", marked, version);
        Ok(marked)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
