//! LAN synchronization
//!
//! Devices find each other with signed multicast announcements
//! ([`discovery`]), exchange framed messages over TCP or WebSocket
//! ([`codec`], [`transport`]) and merge entry deltas with last-write-wins
//! ([`reconcile`]). [`engine`] ties the pieces together.

pub mod codec;
pub mod discovery;
pub mod engine;
pub mod message;
pub mod reconcile;
pub mod transport;

pub use codec::{ByteOrder, FrameCodec, TolerantCodec, DEFAULT_MAX_FRAME};
pub use discovery::{
    Announcement, DiscoveredDevice, Discovery, DiscoveryEvent, DiscoverySettings, PeerTable,
};
pub use engine::{SyncEngine, SyncEvent, SyncReport, SyncSettings, DEFAULT_TCP_PORT, DEFAULT_WS_PORT};
pub use message::{Envelope, SyncAck, SyncError, SyncMessage, SyncRequest, SyncResponse};
pub use reconcile::{reconcile, MergeDecision, MergeSummary, RecordStamp};
pub use transport::{MessageChannel, TcpChannel, WsChannel};
