//! Message channels
//!
//! The sync engine speaks [`SyncMessage`]s over anything implementing
//! [`MessageChannel`]. Two transports exist: a TCP stream framed with the
//! big-endian [`FrameCodec`], and a WebSocket carrying one envelope per text
//! message.

use crate::error::{Error, Result};
use crate::sync::codec::FrameCodec;
use crate::sync::message::{Envelope, SyncMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::codec::Framed;
use tracing::debug;

/// A bidirectional, ordered channel of sync messages
#[async_trait]
pub trait MessageChannel: Send {
    /// Send one message
    async fn send(&mut self, message: &SyncMessage) -> Result<()>;

    /// Next message, or `None` once the peer has closed the channel
    async fn recv(&mut self) -> Result<Option<SyncMessage>>;

    /// Close the channel
    async fn close(&mut self) -> Result<()>;

    /// Printable peer address
    fn peer(&self) -> String;
}

/// Framed TCP channel
pub struct TcpChannel {
    framed: Framed<TcpStream, FrameCodec<Envelope>>,
    peer: String,
}

impl TcpChannel {
    /// Wrap an accepted or connected stream
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }
        TcpChannel {
            framed: Framed::new(stream, FrameCodec::stream()),
            peer,
        }
    }

    /// Connect to a peer's sync port
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::PeerUnreachable(format!("{}: connect timed out", addr)))?
            .map_err(|e| Error::PeerUnreachable(format!("{}: {}", addr, e)))?;
        debug!("Connected to {} over TCP", addr);
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl MessageChannel for TcpChannel {
    async fn send(&mut self, message: &SyncMessage) -> Result<()> {
        self.framed.send(message.to_envelope()?).await
    }

    async fn recv(&mut self) -> Result<Option<SyncMessage>> {
        match self.framed.next().await {
            Some(envelope) => Ok(Some(SyncMessage::from_envelope(envelope?)?)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::<Envelope>::close(&mut self.framed).await
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// WebSocket channel over any byte stream
pub struct WsChannel<S> {
    stream: WebSocketStream<S>,
    peer: String,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established WebSocket
    pub fn new(stream: WebSocketStream<S>, peer: impl Into<String>) -> Self {
        WsChannel {
            stream,
            peer: peer.into(),
        }
    }
}

impl WsChannel<TcpStream> {
    /// Complete the server side handshake on an accepted stream
    pub async fn accept(stream: TcpStream) -> Result<Self> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let ws = tokio_tungstenite::accept_async(stream).await?;
        Ok(Self::new(ws, peer))
    }
}

impl WsChannel<MaybeTlsStream<TcpStream>> {
    /// Connect to `ws://addr/`
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let url = format!("ws://{}/", addr);
        let (ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| Error::PeerUnreachable(format!("{}: connect timed out", addr)))?
            .map_err(|e| Error::PeerUnreachable(format!("{}: {}", addr, e)))?;
        debug!("Connected to {} over WebSocket", addr);
        Ok(Self::new(ws, addr.to_string()))
    }
}

#[async_trait]
impl<S> MessageChannel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: &SyncMessage) -> Result<()> {
        self.stream.send(WsMessage::Text(message.to_json()?)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<SyncMessage>> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                WsMessage::Text(text) => return Ok(Some(SyncMessage::from_json(&text)?)),
                WsMessage::Binary(_) => {
                    return Err(Error::Format("binary WebSocket frames are not supported".to_string()))
                }
                WsMessage::Close(_) => return Ok(None),
                // Pings are answered by tungstenite on the next write
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
