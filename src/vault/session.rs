//! Vault session
//!
//! A [`Vault`] owns its record store and, while unlocked, the derived key
//! bundle. Keys never leave the session: every operation that needs them
//! runs inside [`Vault::with_keys`], which also slides the auto-lock
//! deadline forward.

use crate::crypto::{
    constant_time_eq, decrypt_from_string, derive_keys, derive_master_key, encrypt_to_string,
    hash_master_key, DerivedKeyBundle, KdfParams, HASH_SIZE,
};
use crate::error::{Error, Result};
use crate::store::{
    ChangeRecord, EntryRow, RecordStore, SledRecordStore, SyncState, META_HEADER, META_KEY_HASH,
};
use crate::sync::{reconcile, MergeDecision};
use crate::vault::autolock::AutoLockTimer;
use crate::vault::entry::{domain_matches, EntryUpdate, NewEntry, VaultEntry, VaultFolder};
use crate::vault::header::{VaultHeader, HEADER_SIZE};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Default auto-lock timeout (5 minutes)
pub const DEFAULT_AUTO_LOCK_MS: u64 = 300_000;

/// Export document format version
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// Session settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultSettings {
    /// Auto-lock after this much inactivity; `None` disables it
    pub auto_lock_timeout: Option<Duration>,
    /// Argon2id costs for newly created vaults
    pub kdf: KdfParams,
}

impl Default for VaultSettings {
    fn default() -> Self {
        VaultSettings {
            auto_lock_timeout: Some(Duration::from_millis(DEFAULT_AUTO_LOCK_MS)),
            kdf: KdfParams::default(),
        }
    }
}

/// Why a vault locked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    /// `lock()` was called
    Manual,
    /// Auto-lock deadline expired
    Timeout,
    /// Session is shutting down
    Shutdown,
}

enum SessionState {
    Locked,
    Unlocked(DerivedKeyBundle),
}

/// Result of a bulk entry read
#[derive(Debug, Default)]
pub struct EntryListing {
    pub entries: Vec<VaultEntry>,
    /// Rows that could not be decrypted, by entry id
    pub failures: Vec<(String, Error)>,
}

/// Output of [`Vault::export_vault`]
#[derive(Debug)]
pub struct VaultExport {
    /// Base64 document sealed under the export key
    pub data: String,
    pub entries: usize,
    pub folders: usize,
    /// Entries left out because they could not be decrypted
    pub failures: Vec<(String, Error)>,
}

/// Counts from [`Vault::import_vault`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub entries_added: usize,
    pub entries_skipped: usize,
    pub folders_added: usize,
    pub folders_skipped: usize,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportDocument {
    format_version: u32,
    exported_at: i64,
    entries: Vec<VaultEntry>,
    folders: Vec<VaultFolder>,
}

/// An open vault
pub struct Vault {
    store: Arc<dyn RecordStore>,
    header: VaultHeader,
    key_hash: Vec<u8>,
    state: RwLock<SessionState>,
    timer: AutoLockTimer,
    lock_events: broadcast::Sender<LockReason>,
    /// Serializes store mutations so change versions stay dense
    write_lock: Mutex<()>,
    self_ref: Weak<Vault>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("version", &self.header.version)
            .finish_non_exhaustive()
    }
}

impl Vault {
    fn new_session(
        store: Arc<dyn RecordStore>,
        header: VaultHeader,
        key_hash: Vec<u8>,
        settings: &VaultSettings,
        keys: Option<DerivedKeyBundle>,
    ) -> Arc<Self> {
        let (lock_events, _) = broadcast::channel(16);
        let state = match keys {
            Some(keys) => SessionState::Unlocked(keys),
            None => SessionState::Locked,
        };

        Arc::new_cyclic(|self_ref| Vault {
            store,
            header,
            key_hash,
            state: RwLock::new(state),
            timer: AutoLockTimer::new(settings.auto_lock_timeout),
            lock_events,
            write_lock: Mutex::new(()),
            self_ref: self_ref.clone(),
        })
    }

    /// Create a sled-backed vault at `path`
    pub async fn create<P: AsRef<Path>>(
        path: P,
        password: &str,
        auto_lock_timeout_ms: Option<u64>,
    ) -> Result<Arc<Self>> {
        let settings = VaultSettings {
            auto_lock_timeout: auto_lock_timeout_ms.map(Duration::from_millis),
            ..VaultSettings::default()
        };
        let store = SledRecordStore::open(path.as_ref())?;
        Self::create_with(Arc::new(store), settings, password).await
    }

    /// Create a vault in an existing store
    pub async fn create_with(
        store: Arc<dyn RecordStore>,
        settings: VaultSettings,
        password: &str,
    ) -> Result<Arc<Self>> {
        settings.kdf.validate()?;
        let header = VaultHeader::generate(&settings.kdf);
        Self::initialize(store, settings, header, None, password).await
    }

    /// Create a vault that shares keys with an existing one, from the
    /// pairing code printed by [`Vault::pairing_code`]. The password must
    /// be the other vault's password.
    pub async fn join_with(
        store: Arc<dyn RecordStore>,
        settings: VaultSettings,
        pairing_code: &str,
        password: &str,
    ) -> Result<Arc<Self>> {
        let bytes = hex::decode(pairing_code.trim())
            .map_err(|e| Error::Format(format!("invalid pairing code: {}", e)))?;
        if bytes.len() != HEADER_SIZE + HASH_SIZE {
            return Err(Error::Format(format!(
                "pairing code must be {} bytes, got {}",
                HEADER_SIZE + HASH_SIZE,
                bytes.len()
            )));
        }
        let header = VaultHeader::deserialize(&bytes[..HEADER_SIZE])?;
        let expected = bytes[HEADER_SIZE..].to_vec();
        Self::initialize(store, settings, header, Some(expected), password).await
    }

    async fn initialize(
        store: Arc<dyn RecordStore>,
        settings: VaultSettings,
        header: VaultHeader,
        expected_hash: Option<Vec<u8>>,
        password: &str,
    ) -> Result<Arc<Self>> {
        if store.get_meta(META_HEADER)?.is_some() {
            return Err(Error::VaultExists("store already holds a vault header".to_string()));
        }

        let keys = derive_off_thread(password, &header).await?;
        let key_hash = hash_master_key(&keys);
        if let Some(expected) = &expected_hash {
            if !constant_time_eq(&key_hash, expected) {
                return Err(Error::InvalidPassword);
            }
        }

        store.put_meta(META_HEADER, &header.serialize())?;
        store.put_meta(META_KEY_HASH, &key_hash)?;
        store.flush()?;

        info!(
            "Vault created (memory {} KiB, {} passes, {} lanes)",
            header.memory_cost, header.time_cost, header.parallelism
        );

        let vault = Self::new_session(store, header, key_hash.to_vec(), &settings, Some(keys));
        vault.arm_timer();
        Ok(vault)
    }

    /// Open the sled-backed vault at `path`, locked
    pub fn open<P: AsRef<Path>>(path: P, settings: VaultSettings) -> Result<Arc<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::VaultNotFound(path.display().to_string()));
        }
        let store = SledRecordStore::open(path)?;
        Self::open_with(Arc::new(store), settings)
    }

    /// Open the vault held in `store`, locked
    pub fn open_with(store: Arc<dyn RecordStore>, settings: VaultSettings) -> Result<Arc<Self>> {
        let header_bytes = store
            .get_meta(META_HEADER)?
            .ok_or_else(|| Error::VaultNotFound("no vault header in store".to_string()))?;
        let header = VaultHeader::deserialize(&header_bytes)?;
        // A corrupt hash surfaces as InvalidPassword at unlock
        let key_hash = store.get_meta(META_KEY_HASH)?.unwrap_or_default();

        debug!("Vault opened, header version {}", header.version);
        Ok(Self::new_session(store, header, key_hash, &settings, None))
    }

    /// Verify `password` and hold the derived keys
    pub async fn unlock(&self, password: &str) -> Result<()> {
        let keys = derive_off_thread(password, &self.header).await?;
        let candidate = hash_master_key(&keys);

        if !constant_time_eq(&candidate, &self.key_hash) {
            warn!("Unlock rejected: password does not match");
            return Err(Error::InvalidPassword);
        }

        *self.state.write() = SessionState::Unlocked(keys);
        self.arm_timer();
        info!("Vault unlocked");
        Ok(())
    }

    /// Drop the keys. No-op when already locked.
    pub fn lock(&self) {
        self.lock_with(LockReason::Manual);
    }

    fn lock_with(&self, reason: LockReason) -> bool {
        let previous = std::mem::replace(&mut *self.state.write(), SessionState::Locked);
        if matches!(previous, SessionState::Locked) {
            return false;
        }
        // Bundle is zeroed as it drops here
        drop(previous);

        self.timer.cancel();
        if let Err(e) = self.store.flush() {
            warn!("Flush on lock failed: {}", e);
        }
        let _ = self.lock_events.send(reason);
        info!("Vault locked ({:?})", reason);
        true
    }

    /// Lock with [`LockReason::Shutdown`]
    pub fn shutdown(&self) {
        self.lock_with(LockReason::Shutdown);
    }

    fn arm_timer(&self) {
        let weak = self.self_ref.clone();
        self.timer.arm(move || match weak.upgrade() {
            Some(vault) => vault.expire(),
            None => true,
        });
    }

    /// Timer callback; only locks if the deadline really passed
    fn expire(&self) -> bool {
        if !self.is_unlocked() {
            return true;
        }
        if !self.timer.is_expired() {
            return false;
        }
        self.lock_with(LockReason::Timeout);
        true
    }

    /// Whether keys are held
    pub fn is_unlocked(&self) -> bool {
        matches!(*self.state.read(), SessionState::Unlocked(_))
    }

    /// Receive a [`LockReason`] each time the vault locks
    pub fn subscribe_lock_events(&self) -> broadcast::Receiver<LockReason> {
        self.lock_events.subscribe()
    }

    /// The vault header
    pub fn header(&self) -> &VaultHeader {
        &self.header
    }

    /// Hex code another device passes to [`Vault::join_with`]
    pub fn pairing_code(&self) -> String {
        let mut bytes = self.header.serialize().to_vec();
        bytes.extend_from_slice(&self.key_hash);
        hex::encode(bytes)
    }

    /// The backing record store
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Run `f` with the session keys, sliding the auto-lock deadline on
    /// success.
    fn with_keys<T>(&self, f: impl FnOnce(&DerivedKeyBundle) -> Result<T>) -> Result<T> {
        let state = self.state.read();
        let keys = match &*state {
            SessionState::Unlocked(keys) => keys,
            SessionState::Locked => return Err(Error::VaultLocked),
        };
        let result = f(keys)?;
        self.timer.touch();
        Ok(result)
    }

    /// Bump the vault sync version for a change to `entry_id`
    fn record_change(&self, entry_id: &str, modified_at: i64) -> Result<u64> {
        let version = self.store.current_version()? + 1;
        self.store.append_change(&ChangeRecord {
            version,
            entry_id: entry_id.to_string(),
            modified_at,
            synced: false,
        })?;
        Ok(version)
    }

    fn load_row(&self, id: &str) -> Result<EntryRow> {
        self.store
            .get_entry(id)?
            .ok_or_else(|| Error::EntryNotFound(id.to_string()))
    }

    fn load_live_row(&self, id: &str) -> Result<EntryRow> {
        let row = self.load_row(id)?;
        if row.is_deleted {
            return Err(Error::EntryDeleted(id.to_string()));
        }
        Ok(row)
    }

    // ---- entries ----

    /// Add an entry with a fresh id and version 0
    pub fn add_entry(&self, new: NewEntry) -> Result<VaultEntry> {
        self.with_keys(|keys| {
            if let Some(folder_id) = &new.folder_id {
                self.require_folder(folder_id)?;
            }

            let now = now_ms();
            let entry = VaultEntry {
                id: Uuid::new_v4().to_string(),
                title: new.title,
                username: new.username,
                password: new.password,
                notes: new.notes,
                totp_secret: new.totp_secret,
                url: new.url,
                folder_id: new.folder_id,
                created_at: now,
                modified_at: now,
                last_used_at: None,
                deleted_at: None,
                sync_version: 0,
                is_deleted: false,
                is_favorite: false,
            };

            let row = entry.seal(keys.vault_key())?;
            let _guard = self.write_lock.lock();
            self.store.put_entry(&row)?;
            let version = self.record_change(&entry.id, now)?;
            debug!("Added entry {} at vault version {}", entry.id, version);
            Ok(entry)
        })
    }

    /// Apply a partial update. Only changed secret fields are re-encrypted.
    pub fn update_entry(&self, id: &str, update: EntryUpdate) -> Result<VaultEntry> {
        self.with_keys(|keys| {
            let _guard = self.write_lock.lock();
            let mut row = self.load_live_row(id)?;
            let mut entry = VaultEntry::open(&row, keys.vault_key())?;
            if update.is_empty() {
                return Ok(entry);
            }

            if let Some(Some(folder_id)) = &update.folder_id {
                self.require_folder(folder_id)?;
            }

            // Reseal everything once, then keep old ciphertext for fields
            // that did not change
            let previous = entry.clone();
            if let Some(title) = update.title {
                entry.title = title;
            }
            if let Some(username) = update.username {
                entry.username = username;
            }
            if let Some(password) = update.password {
                entry.password = password;
            }
            if let Some(notes) = update.notes {
                entry.notes = notes;
            }
            if let Some(totp_secret) = update.totp_secret {
                entry.totp_secret = totp_secret;
            }
            if let Some(url) = update.url {
                entry.url = url;
            }
            if let Some(folder_id) = update.folder_id {
                entry.folder_id = folder_id;
            }

            entry.modified_at = next_timestamp(row.modified_at);
            entry.sync_version = row.sync_version + 1;

            let resealed = entry.seal(keys.vault_key())?;
            if entry.title != previous.title {
                row.title = resealed.title;
            }
            if entry.username != previous.username {
                row.username = resealed.username;
            }
            if entry.password != previous.password {
                row.password = resealed.password;
            }
            if entry.notes != previous.notes {
                row.notes = resealed.notes;
            }
            if entry.totp_secret != previous.totp_secret {
                row.totp_secret = resealed.totp_secret;
            }
            row.url = entry.url.clone();
            row.folder_id = entry.folder_id.clone();
            row.modified_at = entry.modified_at;
            row.sync_version = entry.sync_version;

            self.store.put_entry(&row)?;
            self.record_change(id, row.modified_at)?;
            debug!("Updated entry {} to version {}", id, row.sync_version);
            Ok(entry)
        })
    }

    /// Tombstone an entry. The row is kept so the deletion syncs.
    pub fn delete_entry(&self, id: &str) -> Result<()> {
        self.with_keys(|_| {
            let _guard = self.write_lock.lock();
            let mut row = self.load_live_row(id)?;

            let now = next_timestamp(row.modified_at);
            row.is_deleted = true;
            row.deleted_at = Some(now);
            row.modified_at = now;
            row.sync_version += 1;

            self.store.put_entry(&row)?;
            self.record_change(id, now)?;
            debug!("Deleted entry {}", id);
            Ok(())
        })
    }

    /// Flip the favorite flag, returning the new value
    pub fn toggle_favorite(&self, id: &str) -> Result<bool> {
        self.with_keys(|_| {
            let _guard = self.write_lock.lock();
            let mut row = self.load_live_row(id)?;

            row.is_favorite = !row.is_favorite;
            row.modified_at = next_timestamp(row.modified_at);
            row.sync_version += 1;

            self.store.put_entry(&row)?;
            self.record_change(id, row.modified_at)?;
            Ok(row.is_favorite)
        })
    }

    /// Record that an entry was just used to fill a form. This is not a
    /// content change and does not bump any version.
    pub fn mark_used(&self, id: &str) -> Result<VaultEntry> {
        self.with_keys(|keys| {
            let _guard = self.write_lock.lock();
            let mut row = self.load_live_row(id)?;
            row.last_used_at = Some(now_ms());
            self.store.put_entry(&row)?;
            VaultEntry::open(&row, keys.vault_key())
        })
    }

    /// Decrypt one entry. Tombstones are returned with `is_deleted` set.
    pub fn get_entry(&self, id: &str) -> Result<VaultEntry> {
        self.with_keys(|keys| {
            let row = self.load_row(id)?;
            VaultEntry::open(&row, keys.vault_key())
        })
    }

    fn collect_entries(
        &self,
        keys: &DerivedKeyBundle,
        with_deleted: bool,
    ) -> Result<EntryListing> {
        let mut listing = EntryListing::default();
        for row in self.store.entries()? {
            if row.is_deleted && !with_deleted {
                continue;
            }
            match VaultEntry::open(&row, keys.vault_key()) {
                Ok(entry) => listing.entries.push(entry),
                Err(e) => {
                    warn!("Entry {} failed to decrypt", row.id);
                    listing.failures.push((row.id.clone(), e));
                }
            }
        }
        listing
            .entries
            .sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(listing)
    }

    /// All live entries. Rows that fail to decrypt are reported in
    /// `failures` without failing the call.
    pub fn list_entries(&self) -> Result<EntryListing> {
        self.with_keys(|keys| self.collect_entries(keys, false))
    }

    /// Like [`Vault::list_entries`] but tombstones are included
    pub fn list_all_entries(&self) -> Result<EntryListing> {
        self.with_keys(|keys| self.collect_entries(keys, true))
    }

    /// Live entries whose URL host matches `url`
    pub fn find_entries_by_domain(&self, url: &str) -> Result<Vec<VaultEntry>> {
        self.with_keys(|keys| {
            let mut found = Vec::new();
            for row in self.store.entries()? {
                let matches = row
                    .url
                    .as_deref()
                    .map_or(false, |entry_url| domain_matches(entry_url, url));
                if row.is_deleted || !matches {
                    continue;
                }
                match VaultEntry::open(&row, keys.vault_key()) {
                    Ok(entry) => found.push(entry),
                    Err(e) => warn!("Skipping entry {}: {}", row.id, e),
                }
            }
            found.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
            Ok(found)
        })
    }

    // ---- folders ----

    fn require_folder(&self, id: &str) -> Result<()> {
        match self.store.get_folder(id)? {
            Some(_) => Ok(()),
            None => Err(Error::FolderNotFound(id.to_string())),
        }
    }

    /// Create a folder, optionally under `parent_id`
    pub fn add_folder(&self, name: &str, parent_id: Option<&str>) -> Result<VaultFolder> {
        self.with_keys(|keys| {
            if let Some(parent) = parent_id {
                self.require_folder(parent)?;
            }
            let folder = VaultFolder {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                parent_id: parent_id.map(str::to_string),
                created_at: now_ms(),
            };
            self.store.put_folder(&folder.seal(keys.vault_key())?)?;
            Ok(folder)
        })
    }

    /// All folders
    pub fn list_folders(&self) -> Result<Vec<VaultFolder>> {
        self.with_keys(|keys| {
            let mut folders = Vec::new();
            for row in self.store.folders()? {
                match VaultFolder::open(&row, keys.vault_key()) {
                    Ok(folder) => folders.push(folder),
                    Err(e) => warn!("Skipping folder {}: {}", row.id, e),
                }
            }
            folders.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(folders)
        })
    }

    // ---- export / import ----

    /// Seal every entry (tombstones included) and folder under the export
    /// key. Entries that fail to decrypt are left out and reported.
    pub fn export_vault(&self) -> Result<VaultExport> {
        self.with_keys(|keys| {
            let EntryListing { entries, failures } = self.collect_entries(keys, true)?;
            let mut folders = Vec::new();
            for row in self.store.folders()? {
                match VaultFolder::open(&row, keys.vault_key()) {
                    Ok(folder) => folders.push(folder),
                    Err(e) => warn!("Folder {} left out of export: {}", row.id, e),
                }
            }

            let document = ExportDocument {
                format_version: EXPORT_FORMAT_VERSION,
                exported_at: now_ms(),
                entries,
                folders,
            };
            let json = Zeroizing::new(serde_json::to_string(&document)?);
            info!(
                "Exported {} entries, {} folders ({} unreadable)",
                document.entries.len(),
                document.folders.len(),
                failures.len()
            );
            Ok(VaultExport {
                data: encrypt_to_string(keys.export_key(), &json, &[])?,
                entries: document.entries.len(),
                folders: document.folders.len(),
                failures,
            })
        })
    }

    /// Merge an export into this vault. Records whose id already exists
    /// are skipped, never overwritten.
    pub fn import_vault(&self, data: &str) -> Result<ImportSummary> {
        self.with_keys(|keys| {
            let json = Zeroizing::new(decrypt_from_string(keys.export_key(), data, &[])?);
            let document: ExportDocument = serde_json::from_str(&json)?;
            if document.format_version != EXPORT_FORMAT_VERSION {
                return Err(Error::Format(format!(
                    "unsupported export format version {}",
                    document.format_version
                )));
            }

            let _guard = self.write_lock.lock();
            let mut summary = ImportSummary::default();

            for folder in &document.folders {
                if self.store.get_folder(&folder.id)?.is_some() {
                    summary.folders_skipped += 1;
                    continue;
                }
                self.store.put_folder(&folder.seal(keys.vault_key())?)?;
                summary.folders_added += 1;
            }

            for entry in &document.entries {
                if self.store.get_entry(&entry.id)?.is_some() {
                    summary.entries_skipped += 1;
                    continue;
                }
                self.store.put_entry(&entry.seal(keys.vault_key())?)?;
                self.record_change(&entry.id, entry.modified_at)?;
                summary.entries_added += 1;
            }

            info!(
                "Imported {} entries ({} skipped), {} folders ({} skipped)",
                summary.entries_added,
                summary.entries_skipped,
                summary.folders_added,
                summary.folders_skipped
            );
            Ok(summary)
        })
    }

    // ---- sync support ----

    /// Current vault sync version
    pub fn sync_version(&self) -> Result<u64> {
        self.store.current_version()
    }

    /// Entries changed after `from_version`: those with a newer change
    /// record, plus those modified after the change recorded at
    /// `from_version`. Tombstones are included.
    pub fn entries_changed_since(&self, from_version: u64) -> Result<Vec<VaultEntry>> {
        self.with_keys(|keys| {
            let mut ids: BTreeSet<String> = self
                .store
                .changes_since(from_version)?
                .into_iter()
                .map(|change| change.entry_id)
                .collect();

            let watermark = match from_version {
                0 => None,
                v => self.store.get_change(v)?.map(|change| change.modified_at),
            };

            let mut entries = Vec::new();
            for row in self.store.entries()? {
                let newer = watermark.map_or(false, |w| row.modified_at > w);
                if !ids.remove(&row.id) && !newer {
                    continue;
                }
                match VaultEntry::open(&row, keys.vault_key()) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!("Leaving entry {} out of delta: {}", row.id, e),
                }
            }
            Ok(entries)
        })
    }

    /// Apply one remote entry with last-write-wins
    pub fn apply_remote_entry(&self, remote: &VaultEntry) -> Result<MergeDecision> {
        self.with_keys(|keys| {
            let _guard = self.write_lock.lock();
            let local = self.store.get_entry(&remote.id)?;
            let decision = reconcile(
                local.as_ref().map(|row| crate::sync::RecordStamp {
                    modified_at: row.modified_at,
                    sync_version: row.sync_version,
                }),
                remote.stamp(),
            );

            if decision.is_merge() {
                self.store.put_entry(&remote.seal(keys.vault_key())?)?;
                self.record_change(&remote.id, remote.modified_at)?;
            }
            Ok(decision)
        })
    }

    /// Seal a sync payload under the sync key
    pub fn seal_sync_payload(&self, plaintext: &str, aad: &[u8]) -> Result<String> {
        self.with_keys(|keys| encrypt_to_string(keys.sync_key(), plaintext, aad))
    }

    /// Open a payload sealed by [`Vault::seal_sync_payload`]
    pub fn open_sync_payload(&self, sealed: &str, aad: &[u8]) -> Result<String> {
        self.with_keys(|keys| decrypt_from_string(keys.sync_key(), sealed, aad))
    }

    /// Sync progress with a peer (zeroed for unknown peers)
    pub fn sync_state(&self, device_id: &str) -> Result<SyncState> {
        Ok(self
            .store
            .get_sync_state(device_id)?
            .unwrap_or_else(|| SyncState::new(device_id)))
    }

    /// Record a completed pull from a peer
    pub fn record_sync(&self, device_id: &str, to_version: u64) -> Result<SyncState> {
        let state = SyncState {
            device_id: device_id.to_string(),
            last_sync_time: now_ms(),
            last_sync_version: to_version,
        };
        self.store.put_sync_state(&state)?;
        Ok(state)
    }

    /// Mark local changes up to `version` as delivered
    pub fn mark_changes_synced(&self, version: u64) -> Result<usize> {
        self.store.mark_synced(version)
    }

    /// Sync progress with every known peer
    pub fn sync_states(&self) -> Result<Vec<SyncState>> {
        self.store.sync_states()
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        self.lock_with(LockReason::Shutdown);
    }
}

/// Run Argon2id and HKDF on the blocking pool
async fn derive_off_thread(password: &str, header: &VaultHeader) -> Result<DerivedKeyBundle> {
    let password = Zeroizing::new(password.as_bytes().to_vec());
    let salt = header.salt;
    let params = header.kdf_params();

    tokio::task::spawn_blocking(move || {
        let master = derive_master_key(&password, &salt, &params)?;
        derive_keys(&master)
    })
    .await
    .map_err(|e| Error::Internal(format!("key derivation task failed: {}", e)))?
}

/// Current time in Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A timestamp strictly after `previous`, so a local edit always wins over
/// the state it replaced
fn next_timestamp(previous: i64) -> i64 {
    now_ms().max(previous + 1)
}
