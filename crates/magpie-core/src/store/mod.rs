//! Persistence layer: the document seam and the reorg-aware store.
//!
//! [`Documents`] abstracts the document-level operations on the three
//! collections (`Blocks`, `Transactions`, `OutPoints`); it is backed by
//! MongoDB in production ([`MongoDocuments`]) and by an in-memory map in
//! tests. [`Store`] layers the chain semantics on top: the serialized
//! `put_block` write path with orphan/reorg bookkeeping, the per-block
//! transaction fan-out, and the cached tip height.

#[cfg(test)]
pub mod memory;
pub mod mongo;

#[cfg(test)]
pub use memory::MemoryDocuments;
pub use mongo::MongoDocuments;

use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Block, BlockHash, Network, Transaction, Txid};
use tokio::sync::Mutex;

use crate::error::{CoreError, StorageError};
use crate::types::{BlockRecord, OutPointRecord, ScriptType, SpendingFace, TxRecord};

/// Sentinel for "tip height not yet loaded from the store".
const HEIGHT_UNSET: i32 = i32::MIN;

// ==============================================================================
// Document Seam
// ==============================================================================

/// Document-level operations the store needs from its backend.
///
/// Implementations are expected to handle connection management and
/// (de)serialization internally, and to report unique-key violations as
/// [`StorageError::DuplicateKey`] and empty lookups as
/// [`StorageError::NotFound`].
#[async_trait]
pub trait Documents: Send + Sync {
    async fn insert_block(&self, block: &BlockRecord) -> Result<(), StorageError>;

    /// Primary-key lookup by block hash (lowercase hex).
    async fn block_by_hash(&self, hash: &str) -> Result<BlockRecord, StorageError>;

    /// Any block at `height`, preferring the best-chain record when one
    /// exists (orphans share heights with best-chain blocks).
    async fn block_by_height(&self, height: i32) -> Result<BlockRecord, StorageError>;

    /// The non-orphan block at `height`, if any.
    async fn best_block_at_height(&self, height: i32)
        -> Result<Option<BlockRecord>, StorageError>;

    /// The block with the maximum stored height.
    async fn tip_block(&self) -> Result<BlockRecord, StorageError>;

    async fn set_orphan(&self, hash: &str, is_orphan: bool) -> Result<(), StorageError>;

    async fn insert_tx(&self, tx: &TxRecord) -> Result<(), StorageError>;

    /// The most recently indexed transaction (descending `block_index`).
    async fn latest_tx(&self) -> Result<TxRecord, StorageError>;

    async fn insert_outpoint(&self, outpoint: &OutPointRecord) -> Result<(), StorageError>;

    /// Apply the spending face to the outpoint matching
    /// (`funding_tx_hash`, `funding_tx_index`); `NotFound` when absent.
    async fn set_outpoint_spend(
        &self,
        funding_tx_hash: &str,
        funding_tx_index: u32,
        face: &SpendingFace,
    ) -> Result<(), StorageError>;
}

// ==============================================================================
// Store
// ==============================================================================

/// The reorg-aware write path over a [`Documents`] backend.
///
/// `put_block` is serialized on an internal mutex so concurrent block
/// arrivals linearize and the orphan bookkeeping always sees a
/// consistent tip. The tip height is cached in memory and refreshed
/// from a descending sort on first use.
pub struct Store {
    docs: Arc<dyn Documents>,
    put_lock: Mutex<()>,
    latest_height: AtomicI32,
    chain_cfg: std::sync::RwLock<Option<Network>>,
}

impl Store {
    pub fn new(docs: Arc<dyn Documents>) -> Self {
        Self {
            docs,
            put_lock: Mutex::new(()),
            latest_height: AtomicI32::new(HEIGHT_UNSET),
            chain_cfg: std::sync::RwLock::new(None),
        }
    }

    /// Inject the network used for address decoding in `put_tx`.
    pub fn set_chain_cfg(&self, network: Network) {
        *self.chain_cfg.write().expect("chain cfg lock") = Some(network);
    }

    fn chain_cfg(&self) -> Result<Network, CoreError> {
        self.chain_cfg
            .read()
            .expect("chain cfg lock")
            .ok_or(CoreError::ChainCfgMissing)
    }

    // --------------------------------------------------------------------------
    // Lookups
    // --------------------------------------------------------------------------

    pub async fn get_block_by_hash(&self, hash: &BlockHash) -> Result<BlockRecord, CoreError> {
        Ok(self.docs.block_by_hash(&hash.to_string()).await?)
    }

    pub async fn get_block_by_height(&self, height: i32) -> Result<BlockRecord, CoreError> {
        Ok(self.docs.block_by_height(height).await?)
    }

    pub async fn get_block_hash_by_height(&self, height: i32) -> Result<BlockHash, CoreError> {
        let block = self.docs.block_by_height(height).await?;
        parse_block_hash(&block.hash)
    }

    /// The stored tip height; -1 when the store is empty.
    pub async fn get_latest_block_height(&self) -> Result<i32, CoreError> {
        let cached = self.latest_height.load(Ordering::Acquire);
        if cached != HEIGHT_UNSET {
            return Ok(cached);
        }
        let height = match self.docs.tip_block().await {
            Ok(tip) => tip.height,
            Err(StorageError::NotFound) => -1,
            Err(e) => return Err(e.into()),
        };
        self.latest_height.store(height, Ordering::Release);
        Ok(height)
    }

    /// Hash of the record with maximum height.
    pub async fn get_latest_block_hash(&self) -> Result<BlockHash, CoreError> {
        let tip = self.docs.tip_block().await?;
        parse_block_hash(&tip.hash)
    }

    pub async fn get_latest_tx_hash(&self) -> Result<Txid, CoreError> {
        let tx = self.docs.latest_tx().await?;
        Txid::from_str(&tx.hash)
            .map_err(|e| StorageError::InvalidDocument(format!("txid `{}`: {e}", tx.hash)).into())
    }

    // --------------------------------------------------------------------------
    // Seeding
    // --------------------------------------------------------------------------

    /// Idempotent genesis seeding: height 0, not orphan.
    pub async fn init_genesis_block(&self, genesis: &Block) -> Result<(), CoreError> {
        let record = BlockRecord::from_block(genesis, 0, false);
        match self.docs.insert_block(&record).await {
            Ok(()) => {}
            Err(StorageError::DuplicateKey(_)) => {
                tracing::debug!(block = %record.hash, "genesis block already seeded");
            }
            Err(e) => return Err(e.into()),
        }
        if self.latest_height.load(Ordering::Acquire) < 0 {
            self.latest_height.store(0, Ordering::Release);
        }
        Ok(())
    }

    /// Insert the coinbase sentinel outpoint so coinbase inputs can be
    /// joined without special-casing.
    pub async fn init_coinbase_tx(&self) -> Result<(), CoreError> {
        let sentinel = OutPointRecord::coinbase_sentinel();
        self.docs.insert_outpoint(&sentinel).await?;
        Ok(())
    }

    // --------------------------------------------------------------------------
    // Write Path
    // --------------------------------------------------------------------------

    /// The reorg-aware block write.
    ///
    /// A block whose parent is unknown is dropped silently (it will be
    /// re-offered once its ancestor arrives). A block that does not
    /// extend past the stored tip lands on a side branch as an orphan.
    /// A true tip extension first promotes its branch when the parent
    /// sits on a side branch, flipping the displaced best-chain blocks
    /// to orphans on the way down, then advances the tip. This handles
    /// 1-block and k-block reorganizations uniformly so long as every
    /// block on the new branch has been observed at least once.
    pub async fn put_block(&self, block: &Block) -> Result<(), CoreError> {
        let _guard = self.put_lock.lock().await;

        let hash = block.block_hash();
        let parent = match self
            .docs
            .block_by_hash(&block.header.prev_blockhash.to_string())
            .await
        {
            Ok(parent) => parent,
            Err(StorageError::NotFound) => {
                tracing::debug!(block = %hash, "dropping block with unknown parent");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let height = parent.height + 1;
        let latest = self.get_latest_block_height().await?;

        if height <= latest {
            // Side branch: stored as an orphan, but its transactions are
            // still indexed so later spenders on that branch resolve.
            let record = BlockRecord::from_block(block, height, true);
            self.insert_block_logged(&record).await?;
            self.process_txs(&block.txdata, &hash, height).await;
            return Ok(());
        }

        if parent.is_orphan {
            self.promote_branch(&parent).await?;
        }
        let record = BlockRecord::from_block(block, height, false);
        self.insert_block_logged(&record).await?;
        self.latest_height.store(height, Ordering::Release);
        self.process_txs(&block.txdata, &hash, height).await;
        Ok(())
    }

    /// Walk orphan ancestors of a new tip, swapping each with the
    /// best-chain block at its height, until the fork point is reached.
    async fn promote_branch(&self, parent: &BlockRecord) -> Result<(), StorageError> {
        let mut ancestor = parent.clone();
        while ancestor.is_orphan {
            if let Some(displaced) = self.docs.best_block_at_height(ancestor.height).await? {
                self.docs.set_orphan(&displaced.hash, true).await?;
            }
            self.docs.set_orphan(&ancestor.hash, false).await?;
            tracing::info!(
                block = %ancestor.hash,
                height = ancestor.height,
                "promoted side-branch block to best chain"
            );
            ancestor = match self.docs.block_by_hash(&ancestor.previous_block).await {
                Ok(next) => next,
                Err(StorageError::NotFound) => break,
                Err(e) => return Err(e),
            };
        }
        Ok(())
    }

    async fn insert_block_logged(&self, record: &BlockRecord) -> Result<(), StorageError> {
        match self.docs.insert_block(record).await {
            Ok(()) => Ok(()),
            Err(StorageError::DuplicateKey(_)) => {
                tracing::warn!(block = %record.hash, height = record.height, "block already stored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Index a block's transactions concurrently; individual failures
    /// are logged and do not abort sibling transactions.
    async fn process_txs(&self, txs: &[Transaction], block_hash: &BlockHash, height: i32) {
        let writes = txs.iter().map(|tx| async move {
            if let Err(error) = self.put_tx(tx, block_hash, height).await {
                tracing::error!(block = %block_hash, error = %error, "failed to index transaction");
            }
        });
        futures::future::join_all(writes).await;
    }

    /// Write one transaction: the record itself, the funding face of
    /// every output, and the spending face onto every input's referenced
    /// outpoint. Coinbase inputs resolve against the sentinel installed
    /// by [`Store::init_coinbase_tx`].
    pub async fn put_tx(
        &self,
        tx: &Transaction,
        block_hash: &BlockHash,
        block_index: i32,
    ) -> Result<(), CoreError> {
        let network = self.chain_cfg()?;
        let txid = tx.compute_txid();
        let record = TxRecord::from_tx(tx, &block_hash.to_string(), block_index.max(0) as u32);
        match self.docs.insert_tx(&record).await {
            Ok(()) => {}
            Err(StorageError::DuplicateKey(_)) => {
                // Re-offered block: the fan-out already ran once, and the
                // outpoints carry synthetic keys, so skip instead of
                // duplicating them.
                tracing::debug!(tx = %txid, "transaction already indexed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        for (index, output) in tx.output.iter().enumerate() {
            let script = output.script_pubkey.as_script();
            let spender = bitcoin::Address::from_script(script, network)
                .map(|address| address.to_string())
                .unwrap_or_default();
            let outpoint = OutPointRecord::funding(
                txid.to_string(),
                index as u32,
                format!("{:x}", script),
                output.value.to_sat() as i64,
                spender,
                ScriptType::classify(script),
            );
            self.docs.insert_outpoint(&outpoint).await?;
        }

        for (index, input) in tx.input.iter().enumerate() {
            let face = SpendingFace::from_input(&txid, index as u32, input);
            let funding = input.previous_output;
            match self
                .docs
                .set_outpoint_spend(&funding.txid.to_string(), funding.vout, &face)
                .await
            {
                Ok(()) => {}
                Err(StorageError::NotFound) => {
                    return Err(CoreError::MissingOutPoint {
                        spending_txid: txid,
                        input_index: index as u32,
                        funding_txid: funding.txid,
                        funding_index: funding.vout,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn parse_block_hash(hash: &str) -> Result<BlockHash, CoreError> {
    BlockHash::from_str(hash)
        .map_err(|e| StorageError::InvalidDocument(format!("block hash `{hash}`: {e}")).into())
}

// ==============================================================================
// Tests
// ==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    fn test_store() -> (Arc<MemoryDocuments>, Store) {
        let docs = Arc::new(MemoryDocuments::default());
        let store = Store::new(docs.clone());
        store.set_chain_cfg(Network::Regtest);
        (docs, store)
    }

    async fn seeded_store() -> (Arc<MemoryDocuments>, Store, Block) {
        let (docs, store) = test_store();
        let genesis = bitcoin::blockdata::constants::genesis_block(Network::Regtest);
        store.init_genesis_block(&genesis).await.expect("seed genesis");
        (docs, store, genesis)
    }

    /// Extend the chain with `count` empty blocks, returning all hashes
    /// including the genesis at index 0.
    async fn extend_chain(store: &Store, genesis: &Block, count: u32) -> Vec<BlockHash> {
        let mut hashes = vec![genesis.block_hash()];
        let mut prev = genesis.block_hash();
        for nonce in 0..count {
            let block = make_block(prev, nonce);
            store.put_block(&block).await.expect("store block");
            prev = block.block_hash();
            hashes.push(prev);
        }
        hashes
    }

    async fn assert_best_chain_unique(docs: &MemoryDocuments) {
        // At every height, at most one record may sit on the best chain.
        let blocks = docs.blocks().await;
        let mut best_heights: Vec<i32> = blocks
            .iter()
            .filter(|b| !b.is_orphan)
            .map(|b| b.height)
            .collect();
        let total = best_heights.len();
        best_heights.sort_unstable();
        best_heights.dedup();
        assert_eq!(total, best_heights.len(), "duplicate best-chain height");
    }

    #[tokio::test]
    async fn fresh_start_linear_extension() {
        let (docs, store, genesis) = seeded_store().await;
        let hashes = extend_chain(&store, &genesis, 5).await;

        assert_eq!(store.get_latest_block_height().await.unwrap(), 5);
        assert_eq!(store.get_latest_block_hash().await.unwrap(), hashes[5]);

        for (height, hash) in hashes.iter().enumerate() {
            let record = store.get_block_by_height(height as i32).await.unwrap();
            assert_eq!(record.hash, hash.to_string());
            assert!(!record.is_orphan, "height {height} should be on best chain");
        }
        assert_best_chain_unique(&docs).await;
    }

    #[tokio::test]
    async fn unknown_parent_is_dropped_silently() {
        let (docs, store, _genesis) = seeded_store().await;

        let stray = make_block(block_hash_from_byte(0xAB), 7);
        store.put_block(&stray).await.expect("drop is not an error");

        assert_eq!(store.get_latest_block_height().await.unwrap(), 0);
        assert_eq!(docs.blocks().await.len(), 1, "only genesis remains");
    }

    #[tokio::test]
    async fn genesis_seeding_is_idempotent() {
        let (docs, store, genesis) = seeded_store().await;
        store.init_genesis_block(&genesis).await.expect("second seed");

        assert_eq!(docs.blocks().await.len(), 1);
        assert_eq!(store.get_latest_block_height().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_block_is_swallowed_with_one_record() {
        let (docs, store, genesis) = seeded_store().await;
        let block = make_block(genesis.block_hash(), 0);
        store.put_block(&block).await.expect("first insert");
        store.put_block(&block).await.expect("duplicate insert");

        assert_eq!(docs.blocks().await.len(), 2);
        assert_eq!(store.get_latest_block_height().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn side_branch_block_is_stored_as_orphan() {
        let (docs, store, genesis) = seeded_store().await;
        let hashes = extend_chain(&store, &genesis, 5).await;

        // Fork off height 2 while the tip is at 5.
        let side = make_block(hashes[2], 99);
        store.put_block(&side).await.expect("store side branch");

        let record = store.get_block_by_hash(&side.block_hash()).await.unwrap();
        assert!(record.is_orphan);
        assert_eq!(record.height, 3);
        assert_eq!(store.get_latest_block_height().await.unwrap(), 5);
        assert_best_chain_unique(&docs).await;
    }

    #[tokio::test]
    async fn competing_tip_block_is_stored_as_orphan() {
        // A block landing exactly at the tip height does not displace
        // the first-seen tip.
        let (docs, store, genesis) = seeded_store().await;
        let hashes = extend_chain(&store, &genesis, 5).await;

        let rival = make_block(hashes[4], 99);
        store.put_block(&rival).await.expect("store rival tip");

        let record = store.get_block_by_hash(&rival.block_hash()).await.unwrap();
        assert!(record.is_orphan);
        assert_eq!(record.height, 5);
        assert_eq!(store.get_latest_block_height().await.unwrap(), 5);
        assert_best_chain_unique(&docs).await;
    }

    #[tokio::test]
    async fn multi_block_reorg_promotes_the_longer_branch() {
        let (docs, store, genesis) = seeded_store().await;
        let chain_a = extend_chain(&store, &genesis, 5).await;

        // Chain B forks from A2 and overtakes: B3, B4, B5, B6.
        let b3 = make_block(chain_a[2], 50);
        let b4 = make_block(b3.block_hash(), 51);
        let b5 = make_block(b4.block_hash(), 52);
        let b6 = make_block(b5.block_hash(), 53);

        for block in [&b3, &b4, &b5] {
            store.put_block(block).await.expect("store branch block");
            // Until the branch overtakes, the tip must not move.
            assert_eq!(store.get_latest_block_height().await.unwrap(), 5);
            let record = store.get_block_by_hash(&block.block_hash()).await.unwrap();
            assert!(record.is_orphan, "branch block waits as orphan");
        }

        store.put_block(&b6).await.expect("store overtaking block");
        assert_eq!(store.get_latest_block_height().await.unwrap(), 6);

        // A3..A5 demoted, B3..B6 promoted.
        for hash in &chain_a[3..=5] {
            let record = store.get_block_by_hash(hash).await.unwrap();
            assert!(record.is_orphan, "old best chain must be demoted");
        }
        for block in [&b3, &b4, &b5, &b6] {
            let record = store.get_block_by_hash(&block.block_hash()).await.unwrap();
            assert!(!record.is_orphan, "new branch must be promoted");
        }
        // A0..A2 (the common prefix) stays on the best chain.
        for hash in &chain_a[0..=2] {
            let record = store.get_block_by_hash(hash).await.unwrap();
            assert!(!record.is_orphan);
        }
        assert_best_chain_unique(&docs).await;

        // The best chain must stay parent-connected above genesis.
        let blocks = docs.blocks().await;
        for record in blocks.iter().filter(|b| !b.is_orphan && b.height > 0) {
            let parent = blocks
                .iter()
                .find(|b| b.hash == record.previous_block)
                .expect("parent record exists");
            assert!(!parent.is_orphan, "best chain is continuous");
        }
    }

    #[tokio::test]
    async fn coinbase_input_joins_the_sentinel() {
        let (docs, store, genesis) = seeded_store().await;
        store.init_coinbase_tx().await.expect("seed sentinel");

        let coinbase = coinbase_tx(50_0000_0000);
        let coinbase_txid = coinbase.compute_txid();
        let block = make_block_with_txs(genesis.block_hash(), 1, vec![coinbase]);
        store.put_block(&block).await.expect("store block");

        let outpoints = docs.outpoints().await;
        let sentinel = outpoints
            .iter()
            .find(|o| o.funding_tx_index == u32::MAX)
            .expect("sentinel exists");
        assert_eq!(sentinel.spending_tx_hash, coinbase_txid.to_string());
        assert_eq!(sentinel.spending_tx_index, 0);

        // The transaction record carries the owning block metadata.
        let txs = docs.txs().await;
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].block_hash, block.block_hash().to_string());
        assert_eq!(txs[0].block_index, 1);
        assert!(txs[0].safe);
    }

    #[tokio::test]
    async fn spend_updates_the_funding_outpoint_in_place() {
        let (docs, store, genesis) = seeded_store().await;
        store.init_coinbase_tx().await.expect("seed sentinel");

        let coinbase = coinbase_tx(50_0000_0000);
        let coinbase_txid = coinbase.compute_txid();
        let block1 = make_block_with_txs(genesis.block_hash(), 1, vec![coinbase]);
        store.put_block(&block1).await.expect("store block 1");

        let spend = spend_tx(coinbase_txid, 0, 49_0000_0000);
        let spend_txid = spend.compute_txid();
        let block2 = make_block_with_txs(block1.block_hash(), 2, vec![spend]);
        store.put_block(&block2).await.expect("store block 2");

        let outpoints = docs.outpoints().await;
        // Only the spent outpoint carries a spending face.
        let funded = outpoints
            .iter()
            .find(|o| o.funding_tx_hash == coinbase_txid.to_string() && o.funding_tx_index == 0)
            .expect("funding outpoint exists");
        assert_eq!(funded.spending_tx_hash, spend_txid.to_string());
        assert!(!funded.spender.is_empty(), "p2wpkh output decodes an address");
        assert_eq!(funded.script_type, "p2wpkh");

        let unspent = outpoints
            .iter()
            .find(|o| o.funding_tx_hash == spend_txid.to_string())
            .expect("spend output indexed");
        assert!(unspent.spending_tx_hash.is_empty(), "unspent face stays empty");
    }

    #[tokio::test]
    async fn spending_a_missing_outpoint_is_a_consistency_error() {
        let (_docs, store, genesis) = seeded_store().await;

        let spend = spend_tx(txid_from_byte(0x77), 0, 1_000);
        let err = store
            .put_tx(&spend, &genesis.block_hash(), 1)
            .await
            .expect_err("missing funding outpoint must fail");
        assert!(matches!(err, CoreError::MissingOutPoint { .. }));
    }

    #[tokio::test]
    async fn reoffered_transaction_is_not_duplicated() {
        let (docs, store, genesis) = seeded_store().await;
        store.init_coinbase_tx().await.expect("seed sentinel");

        let coinbase = coinbase_tx(50_0000_0000);
        let block_hash = genesis.block_hash();
        store.put_tx(&coinbase, &block_hash, 1).await.expect("first put");
        store.put_tx(&coinbase, &block_hash, 1).await.expect("second put");

        assert_eq!(docs.txs().await.len(), 1);
        // One sentinel plus the single coinbase output.
        assert_eq!(docs.outpoints().await.len(), 2);
    }

    #[tokio::test]
    async fn latest_height_is_refreshed_from_the_backend_on_first_use() {
        let (docs, store) = test_store();
        assert_eq!(store.get_latest_block_height().await.unwrap(), -1);

        // A second store over the same documents sees the persisted tip.
        let genesis = bitcoin::blockdata::constants::genesis_block(Network::Regtest);
        store.init_genesis_block(&genesis).await.expect("seed genesis");
        extend_chain(&store, &genesis, 3).await;

        let restarted = Store::new(docs.clone());
        assert_eq!(restarted.get_latest_block_height().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn latest_tx_hash_reports_not_found_on_fresh_store() {
        let (_docs, store, _genesis) = seeded_store().await;
        let err = store.get_latest_tx_hash().await.expect_err("no txs yet");
        assert!(matches!(
            err,
            CoreError::Storage(StorageError::NotFound)
        ));
    }
}
