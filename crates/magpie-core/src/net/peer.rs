//! Outbound peer session speaking the Bitcoin wire protocol.
//!
//! A [`Peer`] owns one connection over any `AsyncRead + AsyncWrite`
//! transport (TCP in production, duplex pipes in tests) and runs two
//! tasks against it: a reader that decodes frames with the `bitcoin`
//! crate's p2p codec and dispatches them to the registered
//! [`MessageListeners`], and a writer that drains the send queue and
//! fires per-message flush signals. The version/verack handshake,
//! ping replies, self-connection defense, and alert filtering all live
//! here; callers only see the send primitives and the disconnect
//! lifecycle.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::consensus::encode;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::message_blockdata::{GetBlocksMessage, GetHeadersMessage};
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Address, Magic, ServiceFlags};
use bitcoin::BlockHash;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{CoreError, NetworkError, ProtocolError};
use crate::net::listener::MessageListeners;

/// Protocol version advertised in our `version` message.
pub const PROTOCOL_VERSION: u32 = 70016;

/// Oldest peer protocol version we will keep talking to.
const MIN_PEER_VERSION: u32 = 70001;

/// Wire frame header: magic (4) + command (12) + length (4) + checksum (4).
const FRAME_HEADER_BYTES: usize = 24;

/// Hard cap on a single frame payload.
const MAX_PAYLOAD_BYTES: usize = 32 * 1024 * 1024;

const USER_AGENT: &str = concat!("/magpie:", env!("CARGO_PKG_VERSION"), "/");

// ==============================================================================
// Peer Configuration
// ==============================================================================

/// Session parameters shared by every peer the engine opens.
#[derive(Clone)]
pub struct PeerConfig {
    pub magic: Magic,
    /// Service bits we advertise (always includes witness).
    pub services: ServiceFlags,
    pub start_height: i32,
    pub listeners: Arc<dyn MessageListeners>,
}

// ==============================================================================
// Peer Session
// ==============================================================================

/// One outbound protocol connection.
pub struct Peer {
    addr: SocketAddr,
    cfg: PeerConfig,
    /// Nonce sent in our version message; echoes of it mean we dialed
    /// ourselves.
    nonce: u64,
    /// Self-reference handed to the session tasks and listeners.
    me: Weak<Peer>,
    out_tx: mpsc::Sender<Outbound>,
    out_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    shutdown: watch::Sender<bool>,
    handshake: watch::Sender<bool>,
}

struct Outbound {
    msg: NetworkMessage,
    /// Fired once the writer has flushed this message to the transport.
    done: Option<mpsc::Sender<()>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("addr", &self.addr).finish()
    }
}

impl Peer {
    /// Create a session handle for an outbound connection to `addr`.
    /// The connection itself is attached with
    /// [`Peer::associate_connection`].
    pub fn new_outbound(cfg: PeerConfig, addr: SocketAddr) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(1);
        Arc::new_cyclic(|me| Self {
            addr,
            cfg,
            nonce: rand::thread_rng().gen(),
            me: me.clone(),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            shutdown: watch::channel(false).0,
            handshake: watch::channel(false).0,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn arc(&self) -> Arc<Peer> {
        self.me.upgrade().expect("session outlives its Arc")
    }

    /// Attach a connected transport and start the session: spawns the
    /// reader and writer tasks and initiates the version handshake.
    pub async fn associate_connection<S>(&self, stream: S) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Some(out_rx) = self.out_rx.lock().await.take() else {
            tracing::warn!(peer = %self.addr, "connection already associated");
            return Ok(());
        };
        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(write_loop(self.arc(), writer, out_rx));
        tokio::spawn(read_loop(self.arc(), reader));

        self.queue_message(NetworkMessage::Version(self.version_message()), None)
            .await
    }

    /// Enqueue a message for the writer. `done` (when given) is
    /// signalled after the message has been flushed to the transport.
    pub async fn queue_message(
        &self,
        msg: NetworkMessage,
        done: Option<mpsc::Sender<()>>,
    ) -> Result<(), NetworkError> {
        self.out_tx
            .send(Outbound { msg, done })
            .await
            .map_err(|_| NetworkError::Disconnected)
    }

    /// Send a `getblocks` request for everything after `locator` up to
    /// `stop_hash` (all-zero for "as much as you have").
    pub async fn push_get_blocks(
        &self,
        locator: Vec<BlockHash>,
        stop_hash: BlockHash,
    ) -> Result<(), NetworkError> {
        let msg = GetBlocksMessage::new(locator, stop_hash);
        self.queue_message(NetworkMessage::GetBlocks(msg), None).await
    }

    /// Send a `getheaders` request bounded by `stop_hash`.
    pub async fn push_get_headers(
        &self,
        locator: Vec<BlockHash>,
        stop_hash: BlockHash,
    ) -> Result<(), NetworkError> {
        let msg = GetHeadersMessage::new(locator, stop_hash);
        self.queue_message(NetworkMessage::GetHeaders(msg), None)
            .await
    }

    /// Tear the session down. Idempotent; both tasks observe the flag
    /// and exit.
    pub fn disconnect(&self) {
        self.shutdown.send_replace(true);
    }

    /// Resolves once the session has been torn down.
    pub async fn wait_for_disconnect(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Resolves once the version/verack exchange has completed.
    pub async fn wait_for_handshake(&self) {
        let mut rx = self.handshake.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn version_message(&self) -> VersionMessage {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();
        let local: SocketAddr = ([0, 0, 0, 0], 0).into();
        let mut version = VersionMessage::new(
            self.cfg.services,
            timestamp,
            Address::new(&self.addr, ServiceFlags::NONE),
            Address::new(&local, self.cfg.services),
            self.nonce,
            USER_AGENT.to_owned(),
            self.cfg.start_height,
        );
        version.version = PROTOCOL_VERSION;
        version
    }

    async fn handle_message(&self, msg: NetworkMessage) -> Result<(), ProtocolError> {
        match msg {
            NetworkMessage::Version(version) => {
                if version.nonce == self.nonce {
                    return Err(ProtocolError::SelfConnection);
                }
                if version.version < MIN_PEER_VERSION {
                    return Err(ProtocolError::ObsoleteVersion {
                        got: version.version,
                        min: MIN_PEER_VERSION,
                    });
                }
                self.cfg.listeners.on_version(&self.arc(), &version).await;
                let _ = self.queue_message(NetworkMessage::Verack, None).await;
            }
            NetworkMessage::Verack => {
                self.handshake.send_replace(true);
            }
            NetworkMessage::Ping(nonce) => {
                let _ = self.queue_message(NetworkMessage::Pong(nonce), None).await;
            }
            NetworkMessage::Pong(_) => {}
            NetworkMessage::Inv(inventory) => {
                self.cfg.listeners.on_inv(&self.arc(), &inventory).await;
            }
            NetworkMessage::Block(block) => {
                self.cfg.listeners.on_block(&self.arc(), block).await;
            }
            NetworkMessage::Headers(headers) => {
                self.cfg.listeners.on_headers(&self.arc(), &headers).await;
            }
            // The reference client bans peers over unsigned alerts; we
            // simply drop them.
            NetworkMessage::Alert(_) => {}
            other => {
                tracing::trace!(peer = %self.addr, command = %other.command(), "ignoring message");
            }
        }
        Ok(())
    }
}

// ==============================================================================
// Session Tasks
// ==============================================================================

async fn write_loop<W>(peer: Arc<Peer>, mut writer: W, mut out_rx: mpsc::Receiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    let mut shutdown = peer.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            outbound = out_rx.recv() => {
                let Some(Outbound { msg, done }) = outbound else { break };
                let raw = RawNetworkMessage::new(peer.cfg.magic, msg);
                let frame = encode::serialize(&raw);
                if let Err(error) = writer.write_all(&frame).await {
                    tracing::debug!(peer = %peer.addr, error = %error, "write failed");
                    break;
                }
                if let Err(error) = writer.flush().await {
                    tracing::debug!(peer = %peer.addr, error = %error, "flush failed");
                    break;
                }
                if let Some(done) = done {
                    let _ = done.send(()).await;
                }
            }
        }
    }
    peer.disconnect();
}

async fn read_loop<R>(peer: Arc<Peer>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut shutdown = peer.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            read = read_message(&mut reader, peer.cfg.magic) => {
                match read {
                    Ok(msg) => {
                        if let Err(error) = peer.handle_message(msg).await {
                            tracing::warn!(peer = %peer.addr, error = %error, "protocol violation");
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::debug!(peer = %peer.addr, error = %error, "read failed");
                        break;
                    }
                }
            }
        }
    }
    peer.disconnect();
}

// ==============================================================================
// Wire Framing
// ==============================================================================

/// Read one wire frame and decode it. The magic is checked before the
/// payload is read; the checksum is verified by the codec.
pub(crate) async fn read_message<R>(
    reader: &mut R,
    magic: Magic,
) -> Result<NetworkMessage, CoreError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_BYTES];
    reader.read_exact(&mut header).await.map_err(NetworkError::Io)?;

    let got = Magic::from_bytes(header[0..4].try_into().expect("4-byte slice"));
    if got != magic {
        return Err(ProtocolError::WrongMagic { got, want: magic }.into());
    }
    let payload_len =
        u32::from_le_bytes(header[16..20].try_into().expect("4-byte slice")) as usize;
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::OversizedMessage(payload_len).into());
    }

    let mut frame = vec![0u8; FRAME_HEADER_BYTES + payload_len];
    frame[..FRAME_HEADER_BYTES].copy_from_slice(&header);
    reader
        .read_exact(&mut frame[FRAME_HEADER_BYTES..])
        .await
        .map_err(NetworkError::Io)?;

    let raw: RawNetworkMessage = encode::deserialize(&frame).map_err(ProtocolError::Decode)?;
    Ok(raw.payload().clone())
}

#[cfg(test)]
pub(crate) async fn write_message<W>(writer: &mut W, magic: Magic, msg: NetworkMessage)
where
    W: AsyncWrite + Unpin,
{
    let raw = RawNetworkMessage::new(magic, msg);
    writer
        .write_all(&encode::serialize(&raw))
        .await
        .expect("write to test transport");
    writer.flush().await.expect("flush test transport");
}

// ==============================================================================
// Tests
// ==============================================================================
