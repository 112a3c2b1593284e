//! Vault session and data model
//!
//! - `header`: fixed 32-byte vault header codec
//! - `entry`: plaintext entry/folder models and domain matching
//! - `autolock`: sliding inactivity timer
//! - `session`: the lock/unlock state machine and every key-dependent operation

mod autolock;
mod entry;
mod header;
mod session;

pub use autolock::AutoLockTimer;
pub use entry::{domain_matches, normalize_host, EntryUpdate, NewEntry, VaultEntry, VaultFolder};
pub use header::{VaultHeader, HEADER_SIZE, HEADER_VERSION};
pub use session::{
    now_ms, EntryListing, ImportSummary, LockReason, Vault, VaultExport, VaultSettings,
    DEFAULT_AUTO_LOCK_MS, EXPORT_FORMAT_VERSION,
};
