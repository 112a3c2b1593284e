//! In-memory record store, used by tests and throwaway vaults

use crate::error::Result;
use crate::store::{ChangeRecord, EntryRow, FolderRow, RecordStore, SyncState};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Tables {
    meta: HashMap<String, Vec<u8>>,
    entries: HashMap<String, EntryRow>,
    folders: HashMap<String, FolderRow>,
    sync_states: HashMap<String, SyncState>,
    changes: BTreeMap<u64, ChangeRecord>,
}

/// Record store backed by plain maps
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<Tables>,
}

impl MemoryRecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.read().meta.get(key).cloned())
    }

    fn put_meta(&self, key: &str, value: &[u8]) -> Result<()> {
        self.tables
            .write()
            .meta
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get_entry(&self, id: &str) -> Result<Option<EntryRow>> {
        Ok(self.tables.read().entries.get(id).cloned())
    }

    fn put_entry(&self, row: &EntryRow) -> Result<()> {
        self.tables
            .write()
            .entries
            .insert(row.id.clone(), row.clone());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<EntryRow>> {
        Ok(self.tables.read().entries.values().cloned().collect())
    }

    fn get_folder(&self, id: &str) -> Result<Option<FolderRow>> {
        Ok(self.tables.read().folders.get(id).cloned())
    }

    fn put_folder(&self, row: &FolderRow) -> Result<()> {
        self.tables
            .write()
            .folders
            .insert(row.id.clone(), row.clone());
        Ok(())
    }

    fn folders(&self) -> Result<Vec<FolderRow>> {
        Ok(self.tables.read().folders.values().cloned().collect())
    }

    fn get_sync_state(&self, device_id: &str) -> Result<Option<SyncState>> {
        Ok(self.tables.read().sync_states.get(device_id).cloned())
    }

    fn put_sync_state(&self, state: &SyncState) -> Result<()> {
        self.tables
            .write()
            .sync_states
            .insert(state.device_id.clone(), state.clone());
        Ok(())
    }

    fn sync_states(&self) -> Result<Vec<SyncState>> {
        Ok(self.tables.read().sync_states.values().cloned().collect())
    }

    fn append_change(&self, change: &ChangeRecord) -> Result<()> {
        self.tables
            .write()
            .changes
            .insert(change.version, change.clone());
        Ok(())
    }

    fn get_change(&self, version: u64) -> Result<Option<ChangeRecord>> {
        Ok(self.tables.read().changes.get(&version).cloned())
    }

    fn changes_since(&self, version: u64) -> Result<Vec<ChangeRecord>> {
        Ok(self
            .tables
            .read()
            .changes
            .range(version.saturating_add(1)..)
            .map(|(_, change)| change.clone())
            .collect())
    }

    fn current_version(&self) -> Result<u64> {
        Ok(self
            .tables
            .read()
            .changes
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    fn mark_synced(&self, version: u64) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut marked = 0;
        for (_, change) in tables.changes.range_mut(..=version) {
            if !change.synced {
                change.synced = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract_tests;

    #[test]
    fn test_contract() {
        let store = MemoryRecordStore::new();
        contract_tests::exercise(&store);
    }
}
