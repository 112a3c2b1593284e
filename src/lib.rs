//! lanvault - Local-first encrypted secret store
//!
//! Credentials are encrypted field by field under keys derived from a master
//! password and kept in an embedded database. Devices that share a vault
//! find each other on the local network and exchange changes directly,
//! with no server in between.

pub mod bridge;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod logging;
pub mod store;
pub mod sync;
pub mod vault;

pub use config::Config;
pub use error::{Error, Result};
pub use vault::Vault;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::identity::DeviceIdentity;
    pub use crate::sync::{SyncEngine, SyncEvent};
    pub use crate::vault::{EntryUpdate, NewEntry, Vault, VaultEntry, VaultSettings};
}
