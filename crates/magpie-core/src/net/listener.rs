//! Inbound-message multiplexer: routes peer callbacks onto the sync
//! engine's channels.
//!
//! [`MessageListeners`] is the per-event capability seam the peer
//! session invokes; [`IndexListener`] is the engine's implementation.
//! One listener instance serves either the discovery phase (publishing
//! witness-capable peers on `valid_peers`) or the sync phase (driving
//! the `inv_done` / `inv_count` / `msg_chan` batch pipeline).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::ServiceFlags;
use bitcoin::Block;
use tokio::sync::{mpsc, Mutex};

use crate::net::peer::Peer;

// ==============================================================================
// Listener Seam
// ==============================================================================

/// Per-event callbacks a peer session invokes on inbound messages.
///
/// Events without an override are dropped on the floor; the session
/// handles protocol plumbing (handshake, ping/pong) itself.
#[async_trait]
pub trait MessageListeners: Send + Sync {
    async fn on_version(&self, _peer: &Arc<Peer>, _version: &VersionMessage) {}

    async fn on_inv(&self, _peer: &Arc<Peer>, _inventory: &[Inventory]) {}

    async fn on_block(&self, _peer: &Arc<Peer>, _block: Block) {}

    async fn on_headers(&self, _peer: &Arc<Peer>, _headers: &[Header]) {}
}

// ==============================================================================
// Index Listener
// ==============================================================================

/// The sync engine's listener. All channel fields are optional so the
/// same type serves both phases; sends on closed channels are ignored
/// because the receiving side tears down first on disconnect.
pub struct IndexListener {
    /// Discovery phase: witness-capable peers, while `can_send` holds.
    valid_peers: Mutex<Option<mpsc::Sender<Arc<Peer>>>>,
    /// Sync phase: whole blocks bound for the processing pipeline.
    msg_chan: Option<mpsc::Sender<Block>>,
    /// Sync phase: fired once the queued get-data has been flushed.
    inv_done: Option<mpsc::Sender<()>>,
    /// Sync phase: cardinality of each block-inventory announcement.
    inv_count: Option<mpsc::Sender<usize>>,
    can_send: AtomicBool,
}

impl IndexListener {
    /// A listener for short-lived discovery sessions.
    pub fn for_discovery(valid_peers: mpsc::Sender<Arc<Peer>>) -> Self {
        Self {
            valid_peers: Mutex::new(Some(valid_peers)),
            msg_chan: None,
            inv_done: None,
            inv_count: None,
            can_send: AtomicBool::new(true),
        }
    }

    /// A listener for the long-lived sync session.
    pub fn for_sync(
        msg_chan: mpsc::Sender<Block>,
        inv_done: mpsc::Sender<()>,
        inv_count: mpsc::Sender<usize>,
    ) -> Self {
        Self {
            valid_peers: Mutex::new(None),
            msg_chan: Some(msg_chan),
            inv_done: Some(inv_done),
            inv_count: Some(inv_count),
            can_send: AtomicBool::new(true),
        }
    }

    /// End the discovery phase: stop publishing and close `valid_peers`
    /// so the consumer's drain terminates.
    pub async fn disable_send(&self) {
        self.can_send.store(false, Ordering::Release);
        self.valid_peers.lock().await.take();
    }
}

#[async_trait]
impl MessageListeners for IndexListener {
    async fn on_version(&self, peer: &Arc<Peer>, version: &VersionMessage) {
        if !self.can_send.load(Ordering::Acquire) {
            return;
        }
        if !version.services.has(ServiceFlags::WITNESS) {
            tracing::debug!(peer = %peer.addr(), "peer does not serve witness data");
            return;
        }
        let sender = self.valid_peers.lock().await.clone();
        if let Some(valid_peers) = sender {
            let _ = valid_peers.send(Arc::clone(peer)).await;
        }
    }

    async fn on_inv(&self, peer: &Arc<Peer>, inventory: &[Inventory]) {
        // Only block announcements drive the download pipeline.
        let announces_blocks = matches!(
            inventory.first(),
            Some(Inventory::Block(_) | Inventory::WitnessBlock(_))
        );
        if !announces_blocks {
            return;
        }
        let (Some(inv_done), Some(inv_count)) = (&self.inv_done, &self.inv_count) else {
            return;
        };

        // Mirror the announcement into a get-data, upgraded to witness
        // blocks since the stored model carries witness data.
        let items: Vec<Inventory> = inventory
            .iter()
            .map(|item| match *item {
                Inventory::Block(hash) => Inventory::WitnessBlock(hash),
                other => other,
            })
            .collect();

        tracing::debug!(peer = %peer.addr(), count = items.len(), "requesting announced blocks");
        if peer
            .queue_message(NetworkMessage::GetData(items), Some(inv_done.clone()))
            .await
            .is_err()
        {
            return;
        }
        let _ = inv_count.send(inventory.len()).await;
    }

    async fn on_block(&self, _peer: &Arc<Peer>, block: Block) {
        if let Some(msg_chan) = &self.msg_chan {
            let _ = msg_chan.send(block).await;
        }
    }

    async fn on_headers(&self, peer: &Arc<Peer>, headers: &[Header]) {
        tracing::debug!(peer = %peer.addr(), count = headers.len(), "received headers");
    }
}
