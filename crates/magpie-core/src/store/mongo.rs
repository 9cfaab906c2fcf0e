//! MongoDB-backed [`Documents`] implementation.
//!
//! Collections: `Blocks` and `Transactions` keyed by hash (lowercase
//! hex), `OutPoints` keyed by a synthetic ObjectId. Writes go one
//! document at a time; there is no transaction boundary around a block
//! and its transactions.

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::{Collection, Database, IndexModel};

use crate::error::StorageError;
use crate::types::{BlockRecord, OutPointRecord, SpendingFace, TxRecord};

use super::Documents;

pub struct MongoDocuments {
    blocks: Collection<BlockRecord>,
    txs: Collection<TxRecord>,
    outpoints: Collection<OutPointRecord>,
}

impl MongoDocuments {
    pub fn new(db: &Database) -> Self {
        Self {
            blocks: db.collection("Blocks"),
            txs: db.collection("Transactions"),
            outpoints: db.collection("OutPoints"),
        }
    }

    /// Create the secondary indexes required for height lookups, parent
    /// walks, and outpoint spend resolution. Safe to call on every
    /// startup; index creation is idempotent server-side.
    pub async fn ensure_indexes(&self) -> Result<(), StorageError> {
        self.blocks
            .create_index(IndexModel::builder().keys(doc! { "height": 1 }).build())
            .await?;
        self.blocks
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "previous_block": 1 })
                    .build(),
            )
            .await?;
        self.outpoints
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "spending_tx_hash": 1 })
                    .build(),
            )
            .await?;
        self.outpoints
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "funding_tx_hash": 1, "funding_tx_index": 1 })
                    .build(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Documents for MongoDocuments {
    async fn insert_block(&self, block: &BlockRecord) -> Result<(), StorageError> {
        self.blocks.insert_one(block).await?;
        Ok(())
    }

    async fn block_by_hash(&self, hash: &str) -> Result<BlockRecord, StorageError> {
        self.blocks
            .find_one(doc! { "_id": hash })
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn block_by_height(&self, height: i32) -> Result<BlockRecord, StorageError> {
        // Heights are non-unique; prefer the best-chain record.
        if let Some(block) = self
            .blocks
            .find_one(doc! { "height": height, "is_orphan": false })
            .await?
        {
            return Ok(block);
        }
        self.blocks
            .find_one(doc! { "height": height })
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn best_block_at_height(
        &self,
        height: i32,
    ) -> Result<Option<BlockRecord>, StorageError> {
        Ok(self
            .blocks
            .find_one(doc! { "height": height, "is_orphan": false })
            .await?)
    }

    async fn tip_block(&self) -> Result<BlockRecord, StorageError> {
        self.blocks
            .find_one(doc! {})
            .sort(doc! { "height": -1 })
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn set_orphan(&self, hash: &str, is_orphan: bool) -> Result<(), StorageError> {
        let updated = self
            .blocks
            .update_one(
                doc! { "_id": hash },
                doc! { "$set": { "is_orphan": is_orphan } },
            )
            .await?;
        if updated.matched_count == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn insert_tx(&self, tx: &TxRecord) -> Result<(), StorageError> {
        self.txs.insert_one(tx).await?;
        Ok(())
    }

    async fn latest_tx(&self) -> Result<TxRecord, StorageError> {
        self.txs
            .find_one(doc! {})
            .sort(doc! { "block_index": -1 })
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn insert_outpoint(&self, outpoint: &OutPointRecord) -> Result<(), StorageError> {
        self.outpoints.insert_one(outpoint).await?;
        Ok(())
    }

    async fn set_outpoint_spend(
        &self,
        funding_tx_hash: &str,
        funding_tx_index: u32,
        face: &SpendingFace,
    ) -> Result<(), StorageError> {
        let updated = self
            .outpoints
            .update_one(
                doc! {
                    "funding_tx_hash": funding_tx_hash,
                    "funding_tx_index": funding_tx_index,
                },
                doc! { "$set": {
                    "spending_tx_hash": face.spending_tx_hash.as_str(),
                    "spending_tx_index": face.spending_tx_index,
                    "sequence": face.sequence,
                    "signature_script": face.signature_script.as_str(),
                    "witness": face.witness.as_str(),
                } },
            )
            .await?;
        if updated.matched_count == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}
