//! In-memory [`Documents`] implementation for unit tests.
//!
//! Plays the role MongoDB plays in production: hash-keyed maps with the
//! same duplicate-key and not-found semantics, plus snapshot accessors
//! so tests can assert on whole collections.

use std::collections::HashMap;

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::types::{BlockRecord, OutPointRecord, SpendingFace, TxRecord};

use super::Documents;

#[derive(Default)]
pub struct MemoryDocuments {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<String, BlockRecord>,
    txs: HashMap<String, TxRecord>,
    outpoints: Vec<OutPointRecord>,
}

impl MemoryDocuments {
    pub async fn blocks(&self) -> Vec<BlockRecord> {
        self.inner.lock().await.blocks.values().cloned().collect()
    }

    pub async fn txs(&self) -> Vec<TxRecord> {
        self.inner.lock().await.txs.values().cloned().collect()
    }

    pub async fn outpoints(&self) -> Vec<OutPointRecord> {
        self.inner.lock().await.outpoints.clone()
    }
}

#[async_trait]
impl Documents for MemoryDocuments {
    async fn insert_block(&self, block: &BlockRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.blocks.contains_key(&block.hash) {
            return Err(StorageError::DuplicateKey(block.hash.clone()));
        }
        inner.blocks.insert(block.hash.clone(), block.clone());
        Ok(())
    }

    async fn block_by_hash(&self, hash: &str) -> Result<BlockRecord, StorageError> {
        self.inner
            .lock()
            .await
            .blocks
            .get(hash)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn block_by_height(&self, height: i32) -> Result<BlockRecord, StorageError> {
        let inner = self.inner.lock().await;
        let at_height = || inner.blocks.values().filter(|b| b.height == height);
        at_height()
            .find(|b| !b.is_orphan)
            .or_else(|| at_height().next())
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn best_block_at_height(
        &self,
        height: i32,
    ) -> Result<Option<BlockRecord>, StorageError> {
        Ok(self
            .inner
            .lock()
            .await
            .blocks
            .values()
            .find(|b| b.height == height && !b.is_orphan)
            .cloned())
    }

    async fn tip_block(&self) -> Result<BlockRecord, StorageError> {
        self.inner
            .lock()
            .await
            .blocks
            .values()
            .max_by_key(|b| (b.height, !b.is_orphan))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn set_orphan(&self, hash: &str, is_orphan: bool) -> Result<(), StorageError> {
        self.inner
            .lock()
            .await
            .blocks
            .get_mut(hash)
            .map(|b| b.is_orphan = is_orphan)
            .ok_or(StorageError::NotFound)
    }

    async fn insert_tx(&self, tx: &TxRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.txs.contains_key(&tx.hash) {
            return Err(StorageError::DuplicateKey(tx.hash.clone()));
        }
        inner.txs.insert(tx.hash.clone(), tx.clone());
        Ok(())
    }

    async fn latest_tx(&self) -> Result<TxRecord, StorageError> {
        self.inner
            .lock()
            .await
            .txs
            .values()
            .max_by_key(|t| t.block_index)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn insert_outpoint(&self, outpoint: &OutPointRecord) -> Result<(), StorageError> {
        let mut record = outpoint.clone();
        record.id = Some(ObjectId::new());
        self.inner.lock().await.outpoints.push(record);
        Ok(())
    }

    async fn set_outpoint_spend(
        &self,
        funding_tx_hash: &str,
        funding_tx_index: u32,
        face: &SpendingFace,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let outpoint = inner
            .outpoints
            .iter_mut()
            .find(|o| {
                o.funding_tx_hash == funding_tx_hash && o.funding_tx_index == funding_tx_index
            })
            .ok_or(StorageError::NotFound)?;
        outpoint.spending_tx_hash = face.spending_tx_hash.clone();
        outpoint.spending_tx_index = face.spending_tx_index;
        outpoint.sequence = face.sequence;
        outpoint.signature_script = face.signature_script.clone();
        outpoint.witness = face.witness.clone();
        Ok(())
    }
}
