//! LAN peer discovery
//!
//! Devices announce themselves with signed JSON datagrams on a multicast
//! group and listen for each other's announcements. An announcement carries
//! a DNS-SD style service record: service type, instance name, sync port
//! and the TXT fields `id`, `name`, `pk` and `v`.
//!
//! Announcements are verified before they touch the peer table: the `pk`
//! prefix must match the full public key and the signature must verify
//! under it. A device id, once seen, stays pinned to its public key until
//! the entry expires.

use crate::error::{Error, Result};
use crate::identity::{verify_signature, DeviceIdentity, PK_PREFIX_LEN};
use crate::vault::{now_ms, Vault};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// DNS-SD service type
pub const SERVICE_TYPE: &str = "_lanvault-sync._tcp";

/// Instance name prefix
pub const INSTANCE_PREFIX: &str = "lanvault-";

/// Default multicast group
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);

/// Default discovery port
pub const DEFAULT_DISCOVERY_PORT: u16 = 47320;

const MAX_DATAGRAM: usize = 4096;

/// TXT fields of an announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxtRecord {
    pub id: String,
    pub name: String,
    pub pk: String,
    pub v: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedPart<'a> {
    service: &'a str,
    instance: &'a str,
    port: u16,
    txt: &'a TxtRecord,
    public_key: &'a str,
    goodbye: bool,
}

/// One discovery datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub service: String,
    pub instance: String,
    /// Sync port the device listens on
    pub port: u16,
    pub txt: TxtRecord,
    /// Hex Ed25519 public key
    pub public_key: String,
    /// Set when the device is leaving
    #[serde(default)]
    pub goodbye: bool,
    /// Hex signature over every other field
    #[serde(default)]
    pub signature: String,
}

impl Announcement {
    /// Build and sign an announcement for this device
    pub fn signed(
        identity: &DeviceIdentity,
        port: u16,
        sync_version: u64,
        goodbye: bool,
    ) -> Result<Self> {
        let mut announcement = Announcement {
            service: SERVICE_TYPE.to_string(),
            instance: format!("{}{}", INSTANCE_PREFIX, identity.device_id),
            port,
            txt: TxtRecord {
                id: identity.device_id.clone(),
                name: identity.name.clone(),
                pk: identity.public_key_prefix(),
                v: sync_version.to_string(),
            },
            public_key: identity.public_key_hex(),
            goodbye,
            signature: String::new(),
        };
        let signature = identity.sign(&announcement.signing_bytes()?)?;
        announcement.signature = hex::encode(signature);
        Ok(announcement)
    }

    fn signing_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&SignedPart {
            service: &self.service,
            instance: &self.instance,
            port: self.port,
            txt: &self.txt,
            public_key: &self.public_key,
            goodbye: self.goodbye,
        })?)
    }

    /// Check structure, key prefix and signature
    pub fn verify(&self) -> Result<()> {
        if self.service != SERVICE_TYPE {
            return Err(Error::Protocol(format!("unexpected service '{}'", self.service)));
        }
        if self.instance != format!("{}{}", INSTANCE_PREFIX, self.txt.id) {
            return Err(Error::Protocol("instance name does not match device id".to_string()));
        }
        if self.txt.pk.len() != PK_PREFIX_LEN || !self.public_key.starts_with(&self.txt.pk) {
            return Err(Error::Protocol("pk does not match public key".to_string()));
        }
        self.txt
            .v
            .parse::<u64>()
            .map_err(|_| Error::Format(format!("invalid version '{}'", self.txt.v)))?;

        let public_key = hex::decode(&self.public_key)
            .map_err(|e| Error::Format(format!("invalid public key: {}", e)))?;
        let signature = hex::decode(&self.signature)
            .map_err(|e| Error::Format(format!("invalid signature: {}", e)))?;
        if signature.is_empty()
            || !verify_signature(&public_key, &self.signing_bytes()?, &signature)
        {
            return Err(Error::Authentication);
        }
        Ok(())
    }

    /// Advertised vault sync version
    pub fn sync_version(&self) -> u64 {
        self.txt.v.parse().unwrap_or(0)
    }
}

/// A peer seen on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    pub host: IpAddr,
    pub port: u16,
    pub public_key: String,
    /// Unix milliseconds of the last announcement
    pub last_seen: i64,
    pub sync_version: u64,
}

impl DiscoveredDevice {
    /// Address of the device's sync listener
    pub fn sync_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Peer table changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    DeviceFound(DiscoveredDevice),
    DeviceUpdated(DiscoveredDevice),
    DeviceLost(String),
}

/// Table of live peers keyed by device id
pub struct PeerTable {
    self_id: String,
    peers: DashMap<String, DiscoveredDevice>,
}

impl PeerTable {
    /// Empty table that ignores announcements from `self_id`
    pub fn new(self_id: impl Into<String>) -> Self {
        PeerTable {
            self_id: self_id.into(),
            peers: DashMap::new(),
        }
    }

    /// Fold one received announcement into the table
    pub fn observe(&self, announcement: &Announcement, source: IpAddr) -> Option<DiscoveryEvent> {
        if let Err(e) = announcement.verify() {
            debug!("Dropping announcement from {}: {}", source, e);
            return None;
        }

        let id = &announcement.txt.id;
        if *id == self.self_id {
            return None;
        }

        if let Some(existing) = self.peers.get(id) {
            if existing.public_key != announcement.public_key {
                warn!("Device {} announced with a different key from {}, ignoring", id, source);
                return None;
            }
        }

        if announcement.goodbye {
            return self
                .peers
                .remove(id)
                .map(|(id, _)| DiscoveryEvent::DeviceLost(id));
        }

        let device = DiscoveredDevice {
            id: id.clone(),
            name: announcement.txt.name.clone(),
            host: source,
            port: announcement.port,
            public_key: announcement.public_key.clone(),
            last_seen: now_ms(),
            sync_version: announcement.sync_version(),
        };

        match self.peers.insert(id.clone(), device.clone()) {
            Some(previous) if previous.host == device.host
                && previous.port == device.port
                && previous.sync_version == device.sync_version
                && previous.name == device.name =>
            {
                None
            }
            Some(_) => Some(DiscoveryEvent::DeviceUpdated(device)),
            None => Some(DiscoveryEvent::DeviceFound(device)),
        }
    }

    /// Remove peers not heard from within `ttl`, returning lost events
    pub fn sweep(&self, ttl: Duration) -> Vec<DiscoveryEvent> {
        let cutoff = now_ms() - ttl.as_millis() as i64;
        let mut lost = Vec::new();
        self.peers.retain(|id, device| {
            let alive = device.last_seen >= cutoff;
            if !alive {
                lost.push(DiscoveryEvent::DeviceLost(id.clone()));
            }
            alive
        });
        lost
    }

    /// Snapshot of every live peer
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// One peer by id
    pub fn get(&self, id: &str) -> Option<DiscoveredDevice> {
        self.peers.get(id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Discovery settings
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub group: Ipv4Addr,
    pub port: u16,
    pub announce_interval: Duration,
    pub peer_ttl: Duration,
    /// Sync port advertised to peers
    pub sync_port: u16,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_DISCOVERY_PORT,
            announce_interval: Duration::from_secs(5),
            peer_ttl: Duration::from_secs(30),
            sync_port: crate::sync::DEFAULT_TCP_PORT,
        }
    }
}

/// Running announce/browse service
pub struct Discovery {
    identity: Arc<DeviceIdentity>,
    vault: Arc<Vault>,
    settings: DiscoverySettings,
    peers: Arc<PeerTable>,
    socket: Arc<UdpSocket>,
    tasks: Vec<JoinHandle<()>>,
}

impl Discovery {
    /// Join the multicast group and start announcing and browsing.
    /// Events arrive on the returned receiver.
    pub async fn start(
        identity: Arc<DeviceIdentity>,
        vault: Arc<Vault>,
        settings: DiscoverySettings,
    ) -> Result<(Self, mpsc::Receiver<DiscoveryEvent>)> {
        let socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            settings.port,
        ))
        .await?;
        socket.join_multicast_v4(settings.group, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        let socket = Arc::new(socket);

        let peers = Arc::new(PeerTable::new(identity.device_id.clone()));
        let (events, rx) = mpsc::channel(64);

        let mut discovery = Discovery {
            identity,
            vault,
            settings,
            peers,
            socket,
            tasks: Vec::new(),
        };
        discovery.spawn_browser(events.clone());
        discovery.spawn_announcer();
        discovery.spawn_sweeper(events);

        info!(
            "Discovery started on {}:{} as {}",
            discovery.settings.group, discovery.settings.port, discovery.identity.device_id
        );
        Ok((discovery, rx))
    }

    fn spawn_browser(&mut self, events: mpsc::Sender<DiscoveryEvent>) {
        let socket = Arc::clone(&self.socket);
        let peers = Arc::clone(&self.peers);
        self.tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Discovery receive failed: {}", e);
                        continue;
                    }
                };
                let announcement: Announcement = match serde_json::from_slice(&buf[..len]) {
                    Ok(a) => a,
                    Err(e) => {
                        debug!("Ignoring malformed datagram from {}: {}", from, e);
                        continue;
                    }
                };
                if let Some(event) = peers.observe(&announcement, from.ip()) {
                    debug!("Discovery event: {:?}", event);
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }));
    }

    fn spawn_announcer(&mut self) {
        let socket = Arc::clone(&self.socket);
        let identity = Arc::clone(&self.identity);
        let vault = Arc::clone(&self.vault);
        let target = SocketAddr::new(IpAddr::V4(self.settings.group), self.settings.port);
        let sync_port = self.settings.sync_port;
        let period = self.settings.announce_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let version = vault.sync_version().unwrap_or(0);
                if let Err(e) = announce(&socket, target, &identity, sync_port, version, false).await {
                    warn!("Announcement failed: {}", e);
                }
            }
        }));
    }

    fn spawn_sweeper(&mut self, events: mpsc::Sender<DiscoveryEvent>) {
        let peers = Arc::clone(&self.peers);
        let ttl = self.settings.peer_ttl;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl / 2);
            loop {
                ticker.tick().await;
                for event in peers.sweep(ttl) {
                    info!("Peer expired: {:?}", event);
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }));
    }

    /// Live peer table
    pub fn peers(&self) -> Arc<PeerTable> {
        Arc::clone(&self.peers)
    }

    /// Send a goodbye and stop every task
    pub async fn shutdown(mut self) {
        let target = SocketAddr::new(IpAddr::V4(self.settings.group), self.settings.port);
        let version = self.vault.sync_version().unwrap_or(0);
        if let Err(e) = announce(
            &self.socket,
            target,
            &self.identity,
            self.settings.sync_port,
            version,
            true,
        )
        .await
        {
            warn!("Goodbye announcement failed: {}", e);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Discovery stopped");
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn announce(
    socket: &UdpSocket,
    target: SocketAddr,
    identity: &DeviceIdentity,
    sync_port: u16,
    version: u64,
    goodbye: bool,
) -> Result<()> {
    let announcement = Announcement::signed(identity, sync_port, version, goodbye)?;
    let bytes = serde_json::to_vec(&announcement)?;
    socket.send_to(&bytes, target).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> DeviceIdentity {
        DeviceIdentity::generate(name.to_string(), None).unwrap()
    }

    fn host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
    }

    #[test]
    fn test_signed_announcement_fields() {
        let device = identity("laptop");
        let announcement = Announcement::signed(&device, 47321, 5, false).unwrap();

        assert_eq!(announcement.service, "_lanvault-sync._tcp");
        assert_eq!(announcement.instance, format!("lanvault-{}", device.device_id));
        assert_eq!(announcement.txt.v, "5");
        assert_eq!(announcement.txt.pk, device.public_key_hex()[..16]);
        assert!(announcement.verify().is_ok());
    }

    #[test]
    fn test_found_updated_lost() {
        let me = identity("me");
        let peer = identity("peer");
        let table = PeerTable::new(me.device_id.clone());

        let first = Announcement::signed(&peer, 47321, 1, false).unwrap();
        match table.observe(&first, host()) {
            Some(DiscoveryEvent::DeviceFound(device)) => {
                assert_eq!(device.id, peer.device_id);
                assert_eq!(device.sync_version, 1);
                assert_eq!(device.sync_addr(), SocketAddr::new(host(), 47321));
            }
            other => panic!("expected DeviceFound, got {:?}", other),
        }

        // Same announcement again changes nothing
        assert!(table.observe(&first, host()).is_none());

        let bumped = Announcement::signed(&peer, 47321, 2, false).unwrap();
        assert!(matches!(
            table.observe(&bumped, host()),
            Some(DiscoveryEvent::DeviceUpdated(ref d)) if d.sync_version == 2
        ));

        let goodbye = Announcement::signed(&peer, 47321, 2, true).unwrap();
        assert_eq!(
            table.observe(&goodbye, host()),
            Some(DiscoveryEvent::DeviceLost(peer.device_id.clone()))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_self_announcements_filtered() {
        let me = identity("me");
        let table = PeerTable::new(me.device_id.clone());
        let own = Announcement::signed(&me, 47321, 1, false).unwrap();
        assert!(table.observe(&own, host()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let peer = identity("peer");
        let table = PeerTable::new("me");

        let mut forged = Announcement::signed(&peer, 47321, 1, false).unwrap();
        forged.txt.v = "99".to_string();
        assert!(matches!(forged.verify(), Err(Error::Authentication)));
        assert!(table.observe(&forged, host()).is_none());

        let mut unsigned = Announcement::signed(&peer, 47321, 1, false).unwrap();
        unsigned.signature.clear();
        assert!(table.observe(&unsigned, host()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_pk_mismatch_rejected() {
        let peer = identity("peer");
        let mut announcement = Announcement::signed(&peer, 47321, 1, false).unwrap();
        announcement.txt.pk = "0000000000000000".to_string();
        assert!(matches!(announcement.verify(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_impostor_key_ignored() {
        let peer = identity("peer");
        let impostor = DeviceIdentity::generate("impostor".to_string(), Some(peer.device_id.clone()))
            .unwrap();
        let table = PeerTable::new("me");

        table
            .observe(&Announcement::signed(&peer, 47321, 1, false).unwrap(), host())
            .unwrap();
        let fake = Announcement::signed(&impostor, 9999, 50, false).unwrap();
        assert!(table.observe(&fake, host()).is_none());
        assert_eq!(table.get(&peer.device_id).unwrap().port, 47321);
    }

    #[test]
    fn test_sweep_expires_silent_peers() {
        let peer = identity("peer");
        let table = PeerTable::new("me");
        table
            .observe(&Announcement::signed(&peer, 47321, 1, false).unwrap(), host())
            .unwrap();

        assert!(table.sweep(Duration::from_secs(60)).is_empty());

        std::thread::sleep(Duration::from_millis(20));
        let lost = table.sweep(Duration::from_millis(5));
        assert_eq!(lost, vec![DiscoveryEvent::DeviceLost(peer.device_id.clone())]);
        assert!(table.is_empty());
    }
}
