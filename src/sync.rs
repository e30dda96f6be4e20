use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::transaction::Transaction;
use crate::types::ErrorKind;

/// Frames larger than this are refused.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Connection timeout")]
    ConnectionTimeout,
    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u32),
    #[error("Unknown peer {0}")]
    UnknownPeer(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::SerializationError(_) | SyncError::FrameTooLarge(_) => ErrorKind::MalformedInput,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::NetworkError(err.to_string())
    }
}

/// Peer-to-peer messages, `{"type": ..., "data": ...}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkMessage {
    NewBlock(Block),
    CreateTransaction(Transaction),
    #[serde(rename_all = "camelCase")]
    RequestBlock {
        block_number: u64,
        request_address: String,
    },
    SendBlock(Block),
    /// Address of a node the receiver should connect to.
    Handshake(String),
}

impl NetworkMessage {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkMessage::NewBlock(_) => "NEW_BLOCK",
            NetworkMessage::CreateTransaction(_) => "CREATE_TRANSACTION",
            NetworkMessage::RequestBlock { .. } => "REQUEST_BLOCK",
            NetworkMessage::SendBlock(_) => "SEND_BLOCK",
            NetworkMessage::Handshake(_) => "HANDSHAKE",
        }
    }
}

pub fn encode_message(message: &NetworkMessage) -> Result<Vec<u8>, SyncError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_message(bytes: &[u8]) -> Result<NetworkMessage, SyncError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Write one length-prefixed (u32 little-endian) JSON frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, message: &NetworkMessage) -> Result<(), SyncError> {
    let body = encode_message(message)?;
    let length = u32::try_from(body.len()).map_err(|_| SyncError::FrameTooLarge(u32::MAX))?;
    if length > MAX_FRAME_LEN {
        return Err(SyncError::FrameTooLarge(length));
    }
    stream.write_all(&length.to_le_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Option<NetworkMessage>, SyncError> {
    let mut length_buffer = [0u8; 4];
    match stream.read_exact(&mut length_buffer).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_le_bytes(length_buffer);
    if length > MAX_FRAME_LEN {
        return Err(SyncError::FrameTooLarge(length));
    }
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(decode_message(&body)?))
}

/// Outbound side of the peer network. The node never touches sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send to every open connection, skipping this node when `exclude_self`.
    async fn send_to_all(&self, message: &NetworkMessage, exclude_self: bool) -> Result<(), SyncError>;
    async fn send_to(&self, address: &str, message: &NetworkMessage) -> Result<(), SyncError>;
    /// Open a connection and introduce ourselves.
    async fn connect(&self, address: &str) -> Result<(), SyncError>;
}

/// Cursor of a node catching up block by block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainSync {
    active: bool,
    next: u64,
}

impl ChainSync {
    pub fn disabled() -> Self {
        ChainSync::default()
    }

    /// Start requesting blocks after `latest`.
    pub fn starting_after(latest: u64) -> Self {
        ChainSync {
            active: true,
            next: latest + 1,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn next_block(&self) -> u64 {
        self.next
    }

    pub fn expects(&self, block_number: u64) -> bool {
        self.active && block_number == self.next
    }

    pub fn request(&self, my_address: &str) -> NetworkMessage {
        NetworkMessage::RequestBlock {
            block_number: self.next,
            request_address: my_address.to_string(),
        }
    }

    pub fn advance(&mut self) {
        self.next += 1;
    }

    pub fn finish(&mut self) {
        if self.active {
            info!(next = self.next, "Chain sync finished");
        }
        self.active = false;
    }
}

type Mailboxes = Arc<Mutex<HashMap<String, mpsc::Sender<NetworkMessage>>>>;

/// In-process network: every joined node can reach every other one.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Mailboxes,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, address: &str) -> (MemoryTransport, mpsc::Receiver<NetworkMessage>) {
        let (sender, inbox) = mpsc::channel(1024);
        self.nodes.lock().await.insert(address.to_string(), sender);
        let transport = MemoryTransport {
            address: address.to_string(),
            nodes: Arc::clone(&self.nodes),
            peers: Mutex::new(HashSet::new()),
        };
        (transport, inbox)
    }
}

pub struct MemoryTransport {
    address: String,
    nodes: Mailboxes,
    peers: Mutex<HashSet<String>>,
}

impl MemoryTransport {
    pub async fn peers(&self) -> Vec<String> {
        self.peers.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to_all(&self, message: &NetworkMessage, exclude_self: bool) -> Result<(), SyncError> {
        let mailboxes: Vec<_> = self
            .nodes
            .lock()
            .await
            .iter()
            .filter(|(address, _)| !(exclude_self && *address == &self.address))
            .map(|(address, mailbox)| (address.clone(), mailbox.clone()))
            .collect();
        for (address, mailbox) in mailboxes {
            if mailbox.send(message.clone()).await.is_err() {
                debug!(peer = %address, "Peer mailbox closed");
            }
        }
        Ok(())
    }

    async fn send_to(&self, address: &str, message: &NetworkMessage) -> Result<(), SyncError> {
        let mailbox = self
            .nodes
            .lock()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| SyncError::UnknownPeer(address.to_string()))?;
        mailbox
            .send(message.clone())
            .await
            .map_err(|_| SyncError::NetworkError(format!("{address} is gone")))
    }

    async fn connect(&self, address: &str) -> Result<(), SyncError> {
        if !self.peers.lock().await.insert(address.to_string()) {
            return Ok(());
        }
        self.send_to(address, &NetworkMessage::Handshake(self.address.clone())).await
    }
}

/// TCP transport: one short-lived connection per outbound frame, a
/// listener task feeding inbound frames to the node.
pub struct TcpTransport {
    my_address: String,
    peers: Arc<Mutex<HashSet<String>>>,
}

impl TcpTransport {
    pub fn new(my_address: impl Into<String>) -> Self {
        Self {
            my_address: my_address.into(),
            peers: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn peers(&self) -> Vec<String> {
        self.peers.lock().await.iter().cloned().collect()
    }

    async fn deliver(address: &str, message: &NetworkMessage) -> Result<(), SyncError> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| SyncError::ConnectionTimeout)??;
        write_frame(&mut stream, message).await
    }

    /// Accept connections on `listen_addr` and forward every decoded frame
    /// to `inbound`. Runs until the listener fails or the node hangs up.
    pub async fn listen(listen_addr: SocketAddr, inbound: mpsc::Sender<NetworkMessage>) -> Result<(), SyncError> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(%listen_addr, "P2P server listening");

        loop {
            let (mut socket, peer) = listener.accept().await?;
            if inbound.is_closed() {
                return Ok(());
            }
            let inbound = inbound.clone();
            tokio::spawn(async move {
                loop {
                    match read_frame(&mut socket).await {
                        Ok(Some(message)) => {
                            if inbound.send(message).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%peer, error = %e, "Dropping connection");
                            break;
                        }
                    }
                }
            });
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_to_all(&self, message: &NetworkMessage, exclude_self: bool) -> Result<(), SyncError> {
        let peers = self.peers().await;
        for peer in peers {
            if exclude_self && peer == self.my_address {
                continue;
            }
            if let Err(e) = Self::deliver(&peer, message).await {
                warn!(%peer, message = message.name(), error = %e, "Failed to send");
            }
        }
        Ok(())
    }

    async fn send_to(&self, address: &str, message: &NetworkMessage) -> Result<(), SyncError> {
        Self::deliver(address, message).await
    }

    async fn connect(&self, address: &str) -> Result<(), SyncError> {
        if address == self.my_address || !self.peers.lock().await.insert(address.to_string()) {
            return Ok(());
        }
        info!(peer = %address, "Connected");
        Self::deliver(address, &NetworkMessage::Handshake(self.my_address.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;

    #[test]
    fn messages_use_type_and_data_envelope() {
        let request = NetworkMessage::RequestBlock {
            block_number: 7,
            request_address: "127.0.0.1:3000".into(),
        };
        let json: serde_json::Value = serde_json::from_slice(&encode_message(&request).unwrap()).unwrap();
        assert_eq!(json["type"], "REQUEST_BLOCK");
        assert_eq!(json["data"]["blockNumber"], 7);
        assert_eq!(json["data"]["requestAddress"], "127.0.0.1:3000");

        let handshake = decode_message(br#"{"type":"HANDSHAKE","data":"ws://peer"}"#).unwrap();
        assert_eq!(handshake, NetworkMessage::Handshake("ws://peer".into()));
        assert!(decode_message(br#"{"type":"PING","data":null}"#).is_err());
    }

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let block = Block::genesis(&ChainConfig::default());
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_frame(&mut client, &NetworkMessage::NewBlock(block.clone())).await.unwrap();
        write_frame(&mut client, &NetworkMessage::Handshake("a".into())).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(NetworkMessage::NewBlock(block)));
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(NetworkMessage::Handshake("a".into())));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(MAX_FRAME_LEN + 1).to_le_bytes()).await.unwrap();
        assert!(matches!(read_frame(&mut server).await, Err(SyncError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn memory_broadcast_can_skip_sender() {
        let network = MemoryNetwork::new();
        let (a, mut a_inbox) = network.join("a").await;
        let (_b, mut b_inbox) = network.join("b").await;

        let message = NetworkMessage::Handshake("x".into());
        a.send_to_all(&message, true).await.unwrap();
        assert_eq!(b_inbox.recv().await, Some(message.clone()));
        assert!(a_inbox.try_recv().is_err());

        a.connect("b").await.unwrap();
        a.connect("b").await.unwrap();
        assert_eq!(b_inbox.recv().await, Some(NetworkMessage::Handshake("a".into())));
        assert!(b_inbox.try_recv().is_err());
        assert_eq!(a.peers().await, vec!["b".to_string()]);
        assert!(matches!(a.send_to("nobody", &message).await, Err(SyncError::UnknownPeer(_))));
    }

    #[test]
    fn chain_sync_walks_forward() {
        let mut sync = ChainSync::starting_after(4);
        assert!(sync.expects(5));
        assert!(!sync.expects(6));
        assert_eq!(
            sync.request("me"),
            NetworkMessage::RequestBlock {
                block_number: 5,
                request_address: "me".into()
            }
        );
        sync.advance();
        assert_eq!(sync.next_block(), 6);
        sync.finish();
        assert!(!sync.is_active());
        assert!(!sync.expects(6));
        assert!(!ChainSync::disabled().is_active());
    }
}
