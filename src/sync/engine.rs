//! Sync exchanges between two devices
//!
//! One exchange runs over one [`MessageChannel`]:
//!
//! 1. the initiator sends `sync-request` with the version it last pulled
//!    from the peer and its own vault version
//! 2. the responder answers with a sealed delta (`sync-response`); if it
//!    trails the initiator it first sends its own `sync-request` back
//! 3. whoever receives a delta applies it entry by entry, records the new
//!    sync state and answers `sync-ack`
//! 4. a `sync-ack` marks the acknowledged local changes as synced
//!
//! Both sides run the same dispatcher and finish once nothing they sent is
//! still awaiting an answer.

use crate::error::{Error, Result};
use crate::sync::discovery::PeerTable;
use crate::sync::message::{SyncAck, SyncError, SyncMessage, SyncRequest, SyncResponse};
use crate::sync::transport::{MessageChannel, TcpChannel, WsChannel};
use crate::sync::{MergeDecision, MergeSummary};
use crate::vault::{Vault, VaultEntry};
use dashmap::DashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Default TCP sync port
pub const DEFAULT_TCP_PORT: u16 = 47321;

/// Default WebSocket sync port
pub const DEFAULT_WS_PORT: u16 = 47322;

/// Engine settings
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// How long to wait for each expected message
    pub request_timeout: Duration,
    /// Auto-sync period
    pub interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            request_timeout: Duration::from_secs(10),
            interval: Duration::from_secs(60),
        }
    }
}

/// Things observers of the engine care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// An exchange finished
    Completed(SyncReport),
    /// A remote entry diverged from the local copy with the same timestamp;
    /// the local copy was kept
    Conflict {
        peer_id: String,
        entry_id: String,
        local_version: u64,
        remote_version: u64,
    },
    /// An exchange failed
    Failed { peer: String, error: String },
}

/// Outcome of one exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub peer_id: String,
    /// Entries we sent
    pub sent: usize,
    /// Entries imported or overwritten locally
    pub merged: usize,
    pub conflicts: usize,
    /// Peer version we are now caught up to, if we pulled
    pub pulled_version: Option<u64>,
    /// Our version the peer acknowledged, if we pushed
    pub acked_version: Option<u64>,
}

/// Removes a peer from the in-progress set when dropped
struct ExchangeGuard {
    active: Arc<DashSet<String>>,
    key: String,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.active.remove(&self.key);
    }
}

/// Drives sync exchanges for one vault
pub struct SyncEngine {
    vault: Arc<Vault>,
    device_id: String,
    settings: SyncSettings,
    active: Arc<DashSet<String>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(vault: Arc<Vault>, device_id: impl Into<String>, settings: SyncSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(SyncEngine {
            vault,
            device_id: device_id.into(),
            settings,
            active: Arc::new(DashSet::new()),
            events,
        })
    }

    /// This device's id as sent on the wire
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Receive [`SyncEvent`]s
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn begin(&self, key: &str) -> Result<ExchangeGuard> {
        if !self.active.insert(key.to_string()) {
            return Err(Error::SyncInProgress(key.to_string()));
        }
        Ok(ExchangeGuard {
            active: Arc::clone(&self.active),
            key: key.to_string(),
        })
    }

    /// Pull from and push to a peer over TCP
    pub async fn sync_with(&self, peer_id: Option<&str>, addr: SocketAddr) -> Result<SyncReport> {
        let key = peer_id.map_or_else(|| addr.to_string(), str::to_string);
        let _guard = self.begin(&key)?;
        let result = match TcpChannel::connect(addr, self.settings.request_timeout).await {
            Ok(mut channel) => self.initiate(&mut channel, peer_id).await,
            Err(e) => Err(e),
        };
        self.finish(&key, result)
    }

    /// Same as [`SyncEngine::sync_with`] over a WebSocket
    pub async fn sync_with_ws(&self, peer_id: Option<&str>, addr: SocketAddr) -> Result<SyncReport> {
        let key = peer_id.map_or_else(|| addr.to_string(), str::to_string);
        let _guard = self.begin(&key)?;
        let result = match WsChannel::connect(addr, self.settings.request_timeout).await {
            Ok(mut channel) => self.initiate(&mut channel, peer_id).await,
            Err(e) => Err(e),
        };
        self.finish(&key, result)
    }

    fn finish(&self, peer: &str, result: Result<SyncReport>) -> Result<SyncReport> {
        match &result {
            Ok(report) => {
                info!(
                    "Sync with {} done: sent {}, merged {}, conflicts {}",
                    report.peer_id, report.sent, report.merged, report.conflicts
                );
                self.emit(SyncEvent::Completed(report.clone()));
            }
            Err(e) => {
                warn!("Sync with {} failed: {}", peer, e);
                self.emit(SyncEvent::Failed {
                    peer: peer.to_string(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    /// Run the initiator side of an exchange on an open channel
    pub async fn initiate<C: MessageChannel + ?Sized>(
        &self,
        channel: &mut C,
        peer_id: Option<&str>,
    ) -> Result<SyncReport> {
        let mut exchange = Exchange::new(self, peer_id);
        let request = exchange.request()?;
        channel.send(&request).await?;
        exchange.pending += 1;

        let result = exchange.run(channel).await;
        let _ = channel.close().await;
        result
    }

    /// Run the responder side of an exchange on an accepted channel
    pub async fn respond<C: MessageChannel + ?Sized>(&self, channel: &mut C) -> Result<SyncReport> {
        let first = self.next_message(channel).await?;
        let peer_id = match &first {
            SyncMessage::Request(request) => request.device_id.clone(),
            other => {
                return Err(Error::Protocol(format!(
                    "expected sync-request, got {}",
                    other.kind()
                )))
            }
        };

        let _guard = match self.begin(&peer_id) {
            Ok(guard) => guard,
            Err(e) => {
                let _ = channel.send(&self.error_message(&e)).await;
                return Err(e);
            }
        };

        let mut exchange = Exchange::new(self, Some(peer_id.as_str()));
        let result = match exchange.handle(channel, first).await {
            Ok(()) => exchange.run(channel).await,
            Err(e) => Err(e),
        };
        let _ = channel.close().await;
        self.finish(&peer_id, result)
    }

    async fn next_message<C: MessageChannel + ?Sized>(&self, channel: &mut C) -> Result<SyncMessage> {
        match tokio::time::timeout(self.settings.request_timeout, channel.recv()).await {
            Err(_) => Err(Error::Timeout(format!("waiting for {}", channel.peer()))),
            Ok(Ok(Some(message))) => Ok(message),
            Ok(Ok(None)) => Err(Error::PeerUnreachable(format!(
                "{} closed the connection",
                channel.peer()
            ))),
            Ok(Err(e)) => Err(e),
        }
    }

    fn error_message(&self, error: &Error) -> SyncMessage {
        SyncMessage::Error(SyncError {
            device_id: self.device_id.clone(),
            message: error.to_string(),
        })
    }

    /// Accept TCP sync connections on `addr`
    pub async fn listen_tcp(self: &Arc<Self>, addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("Sync listening on tcp://{}", local);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let (stream, from) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("TCP accept failed: {}", e);
                        continue;
                    }
                };
                debug!("Sync connection from {}", from);
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let mut channel = TcpChannel::new(stream);
                    if let Err(e) = engine.respond(&mut channel).await {
                        debug!("Inbound sync from {} ended: {}", from, e);
                    }
                });
            }
        });
        Ok((local, handle))
    }

    /// Accept WebSocket sync connections on `addr`
    pub async fn listen_ws(self: &Arc<Self>, addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("Sync listening on ws://{}", local);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let (stream, from) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("WebSocket accept failed: {}", e);
                        continue;
                    }
                };
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let mut channel = match WsChannel::accept(stream).await {
                        Ok(channel) => channel,
                        Err(e) => {
                            debug!("WebSocket handshake with {} failed: {}", from, e);
                            return;
                        }
                    };
                    if let Err(e) = engine.respond(&mut channel).await {
                        debug!("Inbound sync from {} ended: {}", from, e);
                    }
                });
            }
        });
        Ok((local, handle))
    }

    /// Sync with every discovered peer on a fixed interval. Peers are
    /// handled concurrently and failures only affect their own peer.
    pub fn spawn_auto_sync(self: &Arc<Self>, peers: Arc<PeerTable>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.settings.interval);
            // First tick fires immediately; give discovery a period first
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !engine.vault.is_unlocked() {
                    debug!("Vault locked, skipping auto-sync");
                    continue;
                }
                let devices = peers.devices();
                if devices.is_empty() {
                    continue;
                }
                let runs = devices.iter().map(|device| {
                    let engine = Arc::clone(&engine);
                    async move {
                        match engine.sync_with(Some(&device.id), device.sync_addr()).await {
                            Err(e) if e.is_retryable() => {
                                debug!("Auto-sync with {} deferred to next tick: {}", device.id, e)
                            }
                            Err(e) => warn!("Auto-sync with {} failed: {}", device.id, e),
                            Ok(_) => {}
                        }
                    }
                });
                futures::future::join_all(runs).await;
            }
        })
    }
}

/// State of one exchange on one side
struct Exchange<'a> {
    engine: &'a SyncEngine,
    peer_id: Option<String>,
    /// Messages sent that still await an answer
    pending: usize,
    requested: bool,
    report: SyncReport,
}

impl<'a> Exchange<'a> {
    fn new(engine: &'a SyncEngine, peer_id: Option<&str>) -> Self {
        Exchange {
            engine,
            peer_id: peer_id.map(str::to_string),
            pending: 0,
            requested: false,
            report: SyncReport {
                peer_id: peer_id.unwrap_or_default().to_string(),
                ..SyncReport::default()
            },
        }
    }

    fn vault(&self) -> &Vault {
        &self.engine.vault
    }

    fn request(&mut self) -> Result<SyncMessage> {
        let from_version = match &self.peer_id {
            Some(peer) => self.vault().sync_state(peer)?.last_sync_version,
            None => 0,
        };
        self.requested = true;
        Ok(SyncMessage::Request(SyncRequest {
            device_id: self.engine.device_id.clone(),
            from_version,
            my_version: self.vault().sync_version()?,
        }))
    }

    async fn run<C: MessageChannel + ?Sized>(&mut self, channel: &mut C) -> Result<SyncReport> {
        while self.pending > 0 {
            let message = self.engine.next_message(channel).await?;
            self.handle(channel, message).await?;
        }
        Ok(self.report.clone())
    }

    async fn handle<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        message: SyncMessage,
    ) -> Result<()> {
        let sender = message.device_id().to_string();
        if self.peer_id.is_none() {
            self.peer_id = Some(sender.clone());
            self.report.peer_id = sender.clone();
        }

        let outcome = match message {
            SyncMessage::Request(request) => self.on_request(channel, request).await,
            SyncMessage::Response(response) => self.on_response(channel, response).await,
            SyncMessage::Ack(ack) => self.on_ack(ack),
            SyncMessage::Error(err) => {
                return Err(Error::Protocol(format!("{} reported: {}", err.device_id, err.message)))
            }
        };

        if let Err(e) = &outcome {
            let _ = channel.send(&self.engine.error_message(e)).await;
        }
        outcome
    }

    async fn on_request<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        request: SyncRequest,
    ) -> Result<()> {
        let vault = Arc::clone(&self.engine.vault);
        let to_version = vault.sync_version()?;

        // Peer is ahead of us: ask before answering so the peer still
        // awaits our response when the request lands
        if !self.requested && to_version < request.my_version {
            let catch_up = self.request()?;
            channel.send(&catch_up).await?;
            self.pending += 1;
        }

        let entries = vault.entries_changed_since(request.from_version)?;
        let json = Zeroizing::new(serde_json::to_string(&entries)?);
        let sealed = vault.seal_sync_payload(&json, self.engine.device_id.as_bytes())?;

        debug!(
            "Sending {} entries ({}..{}) to {}",
            entries.len(),
            request.from_version,
            to_version,
            request.device_id
        );
        channel
            .send(&SyncMessage::Response(SyncResponse {
                device_id: self.engine.device_id.clone(),
                from_version: request.from_version,
                to_version,
                entry_count: entries.len(),
                sealed,
            }))
            .await?;
        self.report.sent += entries.len();
        self.pending += 1;
        Ok(())
    }

    async fn on_response<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        response: SyncResponse,
    ) -> Result<()> {
        if !self.requested {
            return Err(Error::Protocol("unsolicited sync-response".to_string()));
        }

        let vault = Arc::clone(&self.engine.vault);
        let json = Zeroizing::new(
            vault.open_sync_payload(&response.sealed, response.device_id.as_bytes())?,
        );
        let entries: Vec<VaultEntry> = serde_json::from_str(&json)
            .map_err(|e| Error::Format(format!("invalid sync delta: {}", e)))?;
        if entries.len() != response.entry_count {
            return Err(Error::Format(format!(
                "delta holds {} entries, header says {}",
                entries.len(),
                response.entry_count
            )));
        }

        let mut summary = MergeSummary::default();
        for remote in &entries {
            let decision = vault.apply_remote_entry(remote)?;
            summary.record(decision);
            if decision == MergeDecision::Conflict {
                let local_version = vault
                    .get_entry(&remote.id)
                    .map(|local| local.sync_version)
                    .unwrap_or_default();
                warn!(
                    "Conflict on entry {} with {}: local v{}, remote v{}",
                    remote.id, response.device_id, local_version, remote.sync_version
                );
                self.engine.emit(SyncEvent::Conflict {
                    peer_id: response.device_id.clone(),
                    entry_id: remote.id.clone(),
                    local_version,
                    remote_version: remote.sync_version,
                });
            }
        }

        vault.record_sync(&response.device_id, response.to_version)?;
        channel
            .send(&SyncMessage::Ack(SyncAck {
                device_id: self.engine.device_id.clone(),
                received_version: response.to_version,
                merged_count: summary.merged(),
                conflict_count: summary.conflicts,
            }))
            .await?;

        debug!(
            "Applied delta from {}: {} imported, {} overwritten, {} kept",
            response.device_id, summary.imported, summary.overwritten, summary.kept
        );
        self.report.merged += summary.merged();
        self.report.conflicts += summary.conflicts;
        self.report.pulled_version = Some(response.to_version);
        self.pending = self.pending.saturating_sub(1);
        Ok(())
    }

    fn on_ack(&mut self, ack: SyncAck) -> Result<()> {
        let marked = self.vault().mark_changes_synced(ack.received_version)?;
        debug!(
            "{} acknowledged version {} ({} merged, {} conflicts), {} changes marked synced",
            ack.device_id, ack.received_version, ack.merged_count, ack.conflict_count, marked
        );
        self.report.acked_version = Some(ack.received_version);
        self.pending = self.pending.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::store::MemoryRecordStore;
    use crate::vault::{NewEntry, VaultSettings};

    fn settings() -> VaultSettings {
        VaultSettings {
            auto_lock_timeout: None,
            kdf: KdfParams {
                memory_cost: 1024,
                time_cost: 1,
                parallelism: 1,
            },
        }
    }

    fn engine_settings() -> SyncSettings {
        SyncSettings {
            request_timeout: Duration::from_secs(5),
            interval: Duration::from_secs(60),
        }
    }

    /// Two vaults sharing keys
    async fn pair() -> (Arc<Vault>, Arc<Vault>) {
        let a = Vault::create_with(Arc::new(MemoryRecordStore::new()), settings(), "pw")
            .await
            .unwrap();
        let b = Vault::join_with(
            Arc::new(MemoryRecordStore::new()),
            settings(),
            &a.pairing_code(),
            "pw",
        )
        .await
        .unwrap();
        (a, b)
    }

    /// Let the responder's connection task process the final ack
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fn add(vault: &Vault, title: &str) -> VaultEntry {
        vault
            .add_entry(NewEntry {
                title: title.to_string(),
                username: "user".to_string(),
                password: format!("{}-password", title),
                url: Some(format!("https://{}.example", title)),
                ..NewEntry::default()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_two_device_scenario() {
        let (a, b) = pair().await;
        let engine_a = SyncEngine::new(Arc::clone(&a), "device-a", engine_settings());
        let engine_b = SyncEngine::new(Arc::clone(&b), "device-b", engine_settings());

        for i in 0..5 {
            add(&a, &format!("a{}", i));
        }
        for i in 0..2 {
            add(&b, &format!("b{}", i));
        }
        assert_eq!(a.sync_version().unwrap(), 5);
        assert_eq!(b.sync_version().unwrap(), 2);

        let (addr, server) = engine_a.listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let report = engine_b.sync_with(Some("device-a"), addr).await.unwrap();
        settle().await;
        server.abort();

        assert_eq!(report.merged, 5);
        assert_eq!(report.pulled_version, Some(5));
        assert_eq!(b.sync_state("device-a").unwrap().last_sync_version, 5);

        let titles: Vec<String> = b
            .list_entries()
            .unwrap()
            .entries
            .into_iter()
            .map(|e| e.title)
            .collect();
        for i in 0..5 {
            assert!(titles.contains(&format!("a{}", i)));
        }
        // A's changes were acknowledged
        assert!(a
            .store()
            .changes_since(0)
            .unwrap()
            .iter()
            .all(|change| change.synced));
    }

    #[tokio::test]
    async fn test_responder_catches_up_when_behind() {
        let (a, b) = pair().await;
        let engine_a = SyncEngine::new(Arc::clone(&a), "device-a", engine_settings());
        let engine_b = SyncEngine::new(Arc::clone(&b), "device-b", engine_settings());

        add(&a, "only-on-a");
        for i in 0..3 {
            add(&b, &format!("b{}", i));
        }

        // A serves, B (ahead) initiates: A must pull B's entries too
        let (addr, server) = engine_a.listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let report = engine_b.sync_with(Some("device-a"), addr).await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.sent, 3);
        assert_eq!(report.acked_version, Some(3));

        settle().await;
        server.abort();

        assert_eq!(a.list_entries().unwrap().entries.len(), 4);
        assert_eq!(a.sync_state("device-b").unwrap().last_sync_version, 3);
    }

    #[tokio::test]
    async fn test_second_sync_is_incremental() {
        let (a, b) = pair().await;
        let engine_a = SyncEngine::new(Arc::clone(&a), "device-a", engine_settings());
        let engine_b = SyncEngine::new(Arc::clone(&b), "device-b", engine_settings());
        let (addr, server) = engine_a.listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();

        add(&a, "first");
        engine_b.sync_with(Some("device-a"), addr).await.unwrap();
        settle().await;

        let second = add(&a, "second");
        let report = engine_b.sync_with(Some("device-a"), addr).await.unwrap();
        server.abort();

        assert_eq!(report.merged, 1);
        assert_eq!(b.get_entry(&second.id).unwrap().title, "second");
    }

    #[tokio::test]
    async fn test_deletion_and_update_propagate() {
        let (a, b) = pair().await;
        let engine_a = SyncEngine::new(Arc::clone(&a), "device-a", engine_settings());
        let engine_b = SyncEngine::new(Arc::clone(&b), "device-b", engine_settings());
        let (addr, server) = engine_a.listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let gone = add(&a, "gone");
        let edited = add(&a, "edited");
        engine_b.sync_with(Some("device-a"), addr).await.unwrap();
        settle().await;

        a.delete_entry(&gone.id).unwrap();
        a.update_entry(
            &edited.id,
            crate::vault::EntryUpdate {
                password: Some("rotated".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        engine_b.sync_with(Some("device-a"), addr).await.unwrap();
        server.abort();

        assert!(b.get_entry(&gone.id).unwrap().is_deleted);
        assert_eq!(b.get_entry(&edited.id).unwrap().password, "rotated");
    }

    #[tokio::test]
    async fn test_conflict_emits_event_and_keeps_local() {
        let (a, b) = pair().await;
        let engine_a = SyncEngine::new(Arc::clone(&a), "device-a", engine_settings());
        let engine_b = SyncEngine::new(Arc::clone(&b), "device-b", engine_settings());
        let mut events = engine_b.subscribe();

        // Same entry, same timestamp, diverged independently on B
        let shared = add(&a, "shared");
        let mut rival = shared.clone();
        rival.password = "b-side".to_string();
        rival.sync_version = 7;
        assert_eq!(b.apply_remote_entry(&rival).unwrap(), MergeDecision::Import);

        let (addr, server) = engine_a.listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let report = engine_b.sync_with(Some("device-a"), addr).await.unwrap();
        server.abort();

        assert_eq!(report.conflicts, 1);
        assert_eq!(b.get_entry(&shared.id).unwrap().password, "b-side");

        let mut conflicts = 0;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::Conflict {
                entry_id,
                local_version,
                remote_version,
                ..
            } = event
            {
                assert_eq!(entry_id, shared.id);
                assert_eq!(local_version, 7);
                assert_eq!(remote_version, 0);
                conflicts += 1;
            }
        }
        assert_eq!(conflicts, 1);
    }

    #[tokio::test]
    async fn test_sync_over_websocket() {
        let (a, b) = pair().await;
        let engine_a = SyncEngine::new(Arc::clone(&a), "device-a", engine_settings());
        let engine_b = SyncEngine::new(Arc::clone(&b), "device-b", engine_settings());
        let entry = add(&a, "over-ws");

        let (addr, server) = engine_a.listen_ws("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let report = engine_b.sync_with_ws(Some("device-a"), addr).await.unwrap();
        server.abort();

        assert_eq!(report.merged, 1);
        assert_eq!(b.get_entry(&entry.id).unwrap().title, "over-ws");
    }

    #[tokio::test]
    async fn test_concurrent_sync_with_same_peer_rejected() {
        let (a, _) = pair().await;
        let engine = SyncEngine::new(a, "device-a", engine_settings());
        let _held = engine.begin("device-b").unwrap();

        let result = engine
            .sync_with(Some("device-b"), "127.0.0.1:9".parse().unwrap())
            .await;
        assert!(matches!(result, Err(Error::SyncInProgress(_))));
    }

    #[tokio::test]
    async fn test_unreachable_peer_reports_failure() {
        let (a, _) = pair().await;
        let engine = SyncEngine::new(a, "device-a", engine_settings());
        let mut events = engine.subscribe();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = engine.sync_with(Some("device-b"), addr).await;
        assert!(matches!(result, Err(Error::PeerUnreachable(_))));
        // The guard is released after a failed connect
        assert!(engine.begin("device-b").is_ok());
        assert!(matches!(
            events.try_recv(),
            Ok(SyncEvent::Failed { ref peer, .. }) if peer == "device-b"
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (a, _) = pair().await;
        let engine = SyncEngine::new(
            a,
            "device-a",
            SyncSettings {
                request_timeout: Duration::from_millis(200),
                interval: Duration::from_secs(60),
            },
        );

        // Accepts and never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let result = engine.sync_with(Some("device-b"), addr).await;
        server.abort();
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_locked_responder_reports_error() {
        let (a, b) = pair().await;
        let engine_a = SyncEngine::new(Arc::clone(&a), "device-a", engine_settings());
        let engine_b = SyncEngine::new(Arc::clone(&b), "device-b", engine_settings());
        a.lock();

        let (addr, server) = engine_a.listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let result = engine_b.sync_with(Some("device-a"), addr).await;
        server.abort();

        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(b.sync_state("device-a").unwrap().last_sync_version, 0);
    }
}
