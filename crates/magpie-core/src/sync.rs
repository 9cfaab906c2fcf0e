//! The sync engine: discovery → peer filter → block-download loop →
//! recovery.
//!
//! The engine owns the orchestrating task; workers (the peer session,
//! the block handler, the disconnect watcher) interact with it through
//! per-batch channels rather than shared mutable state. One batch is
//! one inventory announcement: a `getblocks` goes out, the listener
//! queues a mirrored `getdata` (signalling `inv_done` on flush and the
//! batch size on `inv_count`), the handler writes each arriving block
//! through the store and signals `process_done` when the batch drains.
//! A stalled or disconnected peer tears the session down and the engine
//! re-enters with a fresh random peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::p2p::ServiceFlags;
use bitcoin::{Block, BlockHash, Network};
use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::chain::ChainIndex;
use crate::error::{CoreError, NetworkError, StorageError};
use crate::net::discovery::{self, CandidateAddress};
use crate::net::listener::{IndexListener, MessageListeners};
use crate::net::peer::{Peer, PeerConfig};
use crate::params::ChainParams;
use crate::store::Store;

/// TCP connect budget for both discovery probes and sync peers.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a discovery probe waits for the version exchange.
const HANDSHAKE_WAIT: Duration = Duration::from_secs(5);

/// A batch that makes no progress for this long costs the peer its
/// connection.
const STALL_TIMEOUT: Duration = Duration::from_secs(15);

const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

/// Pause before re-picking a peer after a failed attempt.
const RETRY_DELAY: Duration = Duration::from_secs(1);

// ==============================================================================
// Engine State
// ==============================================================================

/// Tip and session state shared with the watcher and progress tasks.
struct SyncState {
    /// Best-chain tip known to have been persisted.
    last_height: AtomicI32,
    last_hash: Mutex<BlockHash>,
    current_peer: Mutex<Option<Arc<Peer>>>,
}

/// Receiving side of one sync session's batch pipeline.
struct BatchPipeline {
    inv_done: mpsc::Receiver<()>,
    inv_count: mpsc::Receiver<usize>,
    process_done: mpsc::Receiver<()>,
    /// Hands each announced batch size to the block handler.
    batch_size: mpsc::Sender<usize>,
}

// ==============================================================================
// Indexer
// ==============================================================================

/// The top-level sync engine.
pub struct Indexer {
    params: ChainParams,
    /// When set, block requests are preceded by checkpoint-anchored
    /// header requests.
    headers_first: bool,
    store: Arc<Store>,
    chain: ChainIndex,
    state: Arc<SyncState>,
    /// Vetted addresses, assembled once during discovery and read-only
    /// afterwards.
    available_peers: Vec<SocketAddr>,
}

impl Indexer {
    pub fn new(network: Network, headers_first: bool, store: Arc<Store>) -> Self {
        let params = ChainParams::new(network);
        let chain = ChainIndex::new(Arc::clone(&store), params.clone());
        Self {
            params,
            headers_first,
            store,
            chain,
            state: Arc::new(SyncState {
                last_height: AtomicI32::new(-1),
                last_hash: Mutex::new(BlockHash::all_zeros()),
                current_peer: Mutex::new(None),
            }),
            available_peers: Vec::new(),
        }
    }

    /// Run the engine: bootstrap the store, discover peers, then sync
    /// indefinitely. Only storage failures during bootstrap are fatal.
    pub async fn run(mut self) -> Result<(), CoreError> {
        self.store.set_chain_cfg(self.params.network);
        self.bootstrap().await?;
        self.discover_peers().await;
        self.sync_loop().await
    }

    // --------------------------------------------------------------------------
    // Start-up
    // --------------------------------------------------------------------------

    /// Seed the genesis block and the coinbase sentinel on a fresh
    /// store, then load the tip into engine state.
    async fn bootstrap(&self) -> Result<(), CoreError> {
        if self.store.get_latest_block_height().await? == -1 {
            let genesis = self.params.genesis_block();
            tracing::info!(
                network = %self.params.network,
                block = %genesis.block_hash(),
                "seeding genesis block"
            );
            self.store.init_genesis_block(&genesis).await?;
        }
        match self.store.get_latest_tx_hash().await {
            Ok(_) => {}
            Err(CoreError::Storage(StorageError::NotFound)) => {
                tracing::info!("seeding coinbase sentinel outpoint");
                self.store.init_coinbase_tx().await?;
            }
            Err(e) => return Err(e),
        }

        let height = self.store.get_latest_block_height().await?;
        self.state.last_height.store(height, Ordering::Release);
        *self.state.last_hash.lock().await = self.store.get_latest_block_hash().await?;
        tracing::info!(height, "resuming from stored tip");
        Ok(())
    }

    // --------------------------------------------------------------------------
    // Discovery Phase
    // --------------------------------------------------------------------------

    /// Resolve the DNS seeds, probe every IPv4 candidate with a
    /// short-lived session, and retain the addresses of peers that
    /// advertise the witness service bit.
    async fn discover_peers(&mut self) {
        let (valid_tx, mut valid_rx) = mpsc::channel(1);
        let listeners = Arc::new(IndexListener::for_discovery(valid_tx));
        let (candidate_tx, mut candidate_rx) = mpsc::channel::<CandidateAddress>(1);
        tokio::spawn(discovery::lookup_peers(
            self.params.dns_seeds,
            self.params.default_port,
            candidate_tx,
        ));

        let probe_cfg = self.peer_config(Arc::clone(&listeners) as Arc<dyn MessageListeners>);
        tokio::spawn({
            let listeners = Arc::clone(&listeners);
            async move {
                let mut probes = JoinSet::new();
                while let Some(candidate) = candidate_rx.recv().await {
                    if !candidate.addr.is_ipv4() {
                        continue;
                    }
                    probes.spawn(probe_peer(probe_cfg.clone(), candidate.addr));
                }
                while probes.join_next().await.is_some() {}
                // Every probe has finished; stop publishing and close
                // valid_peers so the drain below terminates.
                listeners.disable_send().await;
            }
        });

        while let Some(peer) = valid_rx.recv().await {
            tracing::info!(peer = %peer.addr(), "retained peer");
            self.available_peers.push(peer.addr());
            peer.disconnect();
        }
        tracing::info!(count = self.available_peers.len(), "peer discovery complete");
    }

    // --------------------------------------------------------------------------
    // Sync Loop
    // --------------------------------------------------------------------------

    /// Re-enter `start_sync` on every `peer_done` event, indefinitely.
    async fn sync_loop(&self) -> Result<(), CoreError> {
        let (peer_done_tx, mut peer_done_rx) = mpsc::channel::<()>(1);
        let _ = peer_done_tx.try_send(());
        while peer_done_rx.recv().await.is_some() {
            if let Err(error) = self.start_sync(&peer_done_tx).await {
                tracing::warn!(error = %error, "sync attempt failed; retrying with a new peer");
                tokio::time::sleep(RETRY_DELAY).await;
                let _ = peer_done_tx.try_send(());
            }
        }
        Ok(())
    }

    /// One sync session against one random peer: wire up the batch
    /// pipeline, spawn the watcher/progress/handler tasks, and drive
    /// batches until the session ends.
    async fn start_sync(&self, peer_done: &mpsc::Sender<()>) -> Result<(), CoreError> {
        let (msg_tx, msg_rx) = mpsc::channel(1);
        let (inv_done_tx, inv_done_rx) = mpsc::channel(1);
        let (inv_count_tx, inv_count_rx) = mpsc::channel(1);
        let (process_done_tx, process_done_rx) = mpsc::channel(1);
        let (batch_tx, batch_rx) = mpsc::channel(1);

        let listeners = Arc::new(IndexListener::for_sync(msg_tx, inv_done_tx, inv_count_tx));
        let peer = self.get_rand_peer(listeners).await?;
        *self.state.current_peer.lock().await = Some(Arc::clone(&peer));
        tracing::info!(peer = %peer.addr(), "syncing from peer");

        let progress = tokio::spawn({
            let state = Arc::clone(&self.state);
            async move {
                let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let height = state.last_height.load(Ordering::Acquire);
                    let hash = *state.last_hash.lock().await;
                    tracing::info!(height, tip = %hash, "sync progress");
                }
            }
        });

        tokio::spawn({
            let peer = Arc::clone(&peer);
            let state = Arc::clone(&self.state);
            let peer_done = peer_done.clone();
            let progress = progress.abort_handle();
            async move {
                peer.wait_for_disconnect().await;
                progress.abort();
                state.current_peer.lock().await.take();
                let _ = peer_done.send(()).await;
            }
        });

        tokio::spawn(handle_blocks(
            Arc::clone(&self.store),
            msg_rx,
            batch_rx,
            process_done_tx,
        ));

        let pipeline = BatchPipeline {
            inv_done: inv_done_rx,
            inv_count: inv_count_rx,
            process_done: process_done_rx,
            batch_size: batch_tx,
        };
        let result = self.drive_batches(&peer, pipeline).await;
        peer.disconnect();
        result
    }

    /// The batch loop: request → all get-data flushed → batch size →
    /// batch drained → reset the stall budget and refresh the tip.
    async fn drive_batches(
        &self,
        peer: &Arc<Peer>,
        mut pipeline: BatchPipeline,
    ) -> Result<(), CoreError> {
        let stall = tokio::time::sleep(STALL_TIMEOUT);
        tokio::pin!(stall);
        loop {
            self.process_next(peer).await?;

            tokio::select! {
                flushed = pipeline.inv_done.recv() => {
                    if flushed.is_none() { return Ok(()); }
                }
                _ = peer.wait_for_disconnect() => return Ok(()),
                _ = &mut stall => {
                    tracing::warn!(peer = %peer.addr(), "sync stalled; disconnecting");
                    return Ok(());
                }
            }

            let requested = tokio::select! {
                count = pipeline.inv_count.recv() => match count {
                    Some(count) => count,
                    None => return Ok(()),
                },
                _ = peer.wait_for_disconnect() => return Ok(()),
                _ = &mut stall => {
                    tracing::warn!(peer = %peer.addr(), "sync stalled; disconnecting");
                    return Ok(());
                }
            };
            tracing::debug!(requested, "inventory batch in flight");
            if pipeline.batch_size.send(requested).await.is_err() {
                return Ok(());
            }

            tokio::select! {
                drained = pipeline.process_done.recv() => {
                    if drained.is_none() { return Ok(()); }
                }
                _ = peer.wait_for_disconnect() => return Ok(()),
                _ = &mut stall => {
                    tracing::warn!(peer = %peer.addr(), "sync stalled; disconnecting");
                    return Ok(());
                }
            }

            stall
                .as_mut()
                .reset(tokio::time::Instant::now() + STALL_TIMEOUT);
            self.refresh_tip().await?;
        }
    }

    /// Send the next locator-anchored request pair.
    async fn process_next(&self, peer: &Arc<Peer>) -> Result<(), CoreError> {
        let height = self.state.last_height.load(Ordering::Acquire);
        let locator = self.chain.get_block_locator(height).await?;
        if self.headers_first {
            if let Some(checkpoint) = self.chain.find_next_header_checkpoint(height) {
                tracing::debug!(checkpoint = checkpoint.height, "requesting headers to checkpoint");
                peer.push_get_headers(locator.clone(), checkpoint.hash).await?;
            }
        }
        peer.push_get_blocks(locator, BlockHash::all_zeros()).await?;
        Ok(())
    }

    /// Pick a uniformly random vetted address and open a session to it.
    async fn get_rand_peer(
        &self,
        listeners: Arc<dyn MessageListeners>,
    ) -> Result<Arc<Peer>, CoreError> {
        let addr = {
            let mut rng = rand::thread_rng();
            self.available_peers
                .choose(&mut rng)
                .copied()
                .ok_or(NetworkError::NoPeers)?
        };
        let peer = Peer::new_outbound(self.peer_config(listeners), addr);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::DialTimeout(CONNECT_TIMEOUT))?
            .map_err(NetworkError::Io)?;
        peer.associate_connection(stream).await?;
        Ok(peer)
    }

    async fn refresh_tip(&self) -> Result<(), CoreError> {
        let height = self.store.get_latest_block_height().await?;
        self.state.last_height.store(height, Ordering::Release);
        *self.state.last_hash.lock().await = self.store.get_latest_block_hash().await?;
        Ok(())
    }

    fn peer_config(&self, listeners: Arc<dyn MessageListeners>) -> PeerConfig {
        PeerConfig {
            magic: self.params.magic,
            services: ServiceFlags::WITNESS,
            start_height: self.state.last_height.load(Ordering::Acquire),
            listeners,
        }
    }
}

// ==============================================================================
// Worker Tasks
// ==============================================================================

/// Short-lived discovery session: dial, handshake, disconnect. The
/// listener publishes the peer on `valid_peers` if its version message
/// qualifies.
async fn probe_peer(cfg: PeerConfig, addr: SocketAddr) {
    let peer = Peer::new_outbound(cfg, addr);
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            tracing::warn!(peer = %addr, error = %error, "dial failed");
            return;
        }
        Err(_) => {
            tracing::debug!(peer = %addr, "dial timed out");
            return;
        }
    };
    if let Err(error) = peer.associate_connection(stream).await {
        tracing::warn!(peer = %addr, error = %error, "failed to start session");
        return;
    }
    if tokio::time::timeout(HANDSHAKE_WAIT, peer.wait_for_handshake())
        .await
        .is_err()
    {
        tracing::debug!(peer = %addr, "handshake timed out");
    }
    peer.disconnect();
}

/// Write every block from `blocks` through the store and signal
/// `process_done` once a whole announced batch has been written.
/// Failed writes are logged and not counted, so an incomplete batch
/// falls back to stall-driven recovery.
async fn handle_blocks(
    store: Arc<Store>,
    mut blocks: mpsc::Receiver<Block>,
    mut batch_sizes: mpsc::Receiver<usize>,
    process_done: mpsc::Sender<()>,
) {
    let mut requested: usize = 0;
    let mut processed: usize = 0;
    loop {
        tokio::select! {
            biased;
            size = batch_sizes.recv() => match size {
                Some(size) => {
                    requested = size;
                    if requested > 0 && processed >= requested {
                        processed = 0;
                        requested = 0;
                        if process_done.send(()).await.is_err() {
                            break;
                        }
                    }
                }
                None => break,
            },
            block = blocks.recv() => match block {
                Some(block) => {
                    match store.put_block(&block).await {
                        Ok(()) => {
                            processed += 1;
                            if requested > 0 && processed >= requested {
                                processed = 0;
                                requested = 0;
                                if process_done.send(()).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(error) => {
                            tracing::error!(
                                block = %block.block_hash(),
                                error = %error,
                                "failed to store block"
                            );
                        }
                    }
                }
                None => break,
            },
        }
    }
}

// ==============================================================================
// Tests
// ==============================================================================
