//! Persisted record types for Magpie's block/transaction/output model.
//!
//! Contains the document records written to the store (`BlockRecord`,
//! `TxRecord`, `OutPointRecord`), the spending-face update payload, and
//! the `ScriptType` classification shared by outputs and outpoints.

use bitcoin::hashes::Hash;
use bitcoin::hex::DisplayHex;
use bitcoin::{Block, Script, Transaction, Txid};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

// ==============================================================================
// Script Type Classification
// ==============================================================================

/// Classifies a script output type. Delegates detection to the `bitcoin`
/// crate's `Script::is_p2pkh()`, `is_p2sh()`, etc. methods — we
/// intentionally avoid reimplementing script pattern matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    P2pk,
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    BareMultisig,
    OpReturn,
    Unknown,
}

impl ScriptType {
    /// Classify a scriptPubKey into its standard script class.
    pub fn classify(script: &Script) -> Self {
        if script.is_p2pkh() {
            Self::P2pkh
        } else if script.is_p2sh() {
            Self::P2sh
        } else if script.is_p2wpkh() {
            Self::P2wpkh
        } else if script.is_p2wsh() {
            Self::P2wsh
        } else if script.is_p2tr() {
            Self::P2tr
        } else if script.is_op_return() {
            Self::OpReturn
        } else if script.is_p2pk() {
            Self::P2pk
        } else if script.is_multisig() {
            Self::BareMultisig
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P2pk => write!(f, "p2pk"),
            Self::P2pkh => write!(f, "p2pkh"),
            Self::P2sh => write!(f, "p2sh"),
            Self::P2wpkh => write!(f, "p2wpkh"),
            Self::P2wsh => write!(f, "p2wsh"),
            Self::P2tr => write!(f, "p2tr"),
            Self::BareMultisig => write!(f, "bare_multisig"),
            Self::OpReturn => write!(f, "op_return"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// ==============================================================================
// Block Record
// ==============================================================================

/// A block document, keyed by its hash rendered as lowercase hex.
///
/// Heights are shared between best-chain blocks and orphans; at most one
/// record per height has `is_orphan = false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    #[serde(rename = "_id")]
    pub hash: String,
    pub height: i32,
    pub is_orphan: bool,
    /// Parent block hash; all-zero hex for the genesis block.
    pub previous_block: String,
    pub version: i32,
    pub nonce: u32,
    pub timestamp: i64,
    pub bits: u32,
    pub merkle_root: String,
}

impl BlockRecord {
    /// Build a record from a decoded network block at a known height.
    pub fn from_block(block: &Block, height: i32, is_orphan: bool) -> Self {
        Self {
            hash: block.block_hash().to_string(),
            height,
            is_orphan,
            previous_block: block.header.prev_blockhash.to_string(),
            version: block.header.version.to_consensus(),
            nonce: block.header.nonce,
            timestamp: i64::from(block.header.time),
            bits: block.header.bits.to_consensus(),
            merkle_root: block.header.merkle_root.to_string(),
        }
    }
}

// ==============================================================================
// Transaction Record
// ==============================================================================

/// A transaction document, keyed by txid as lowercase hex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    #[serde(rename = "_id")]
    pub hash: String,
    pub lock_time: u32,
    pub version: i32,
    /// Reserved for later validity tagging; always true for stored txs.
    pub safe: bool,
    pub block_hash: String,
    /// Height of the owning block at insert time.
    pub block_index: u32,
}

impl TxRecord {
    pub fn from_tx(tx: &Transaction, block_hash: &str, block_index: u32) -> Self {
        Self {
            hash: tx.compute_txid().to_string(),
            lock_time: tx.lock_time.to_consensus_u32(),
            version: tx.version.0,
            safe: true,
            block_hash: block_hash.to_owned(),
            block_index,
        }
    }
}

// ==============================================================================
// OutPoint Record
// ==============================================================================

/// The edge between a funding output and its spending input.
///
/// Created with the funding face populated when a transaction's output is
/// written; the spending face stays empty until a later input references
/// (`funding_tx_hash`, `funding_tx_index`) and is then updated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutPointRecord {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none", default)]
    pub id: Option<ObjectId>,

    pub spending_tx_hash: String,
    pub spending_tx_index: u32,
    pub sequence: u32,
    pub signature_script: String,
    /// Witness stack segments as hex, joined by commas.
    pub witness: String,

    pub funding_tx_hash: String,
    pub funding_tx_index: u32,
    pub pk_script: String,
    /// Output value in satoshis.
    pub value: i64,
    /// Decoded address string; empty when the script is undecodable.
    pub spender: String,
    #[serde(rename = "type")]
    pub script_type: String,
}

impl OutPointRecord {
    /// A fresh outpoint with only the funding face populated.
    pub fn funding(
        funding_tx_hash: String,
        funding_tx_index: u32,
        pk_script: String,
        value: i64,
        spender: String,
        script_type: ScriptType,
    ) -> Self {
        Self {
            id: None,
            spending_tx_hash: String::new(),
            spending_tx_index: 0,
            sequence: 0,
            signature_script: String::new(),
            witness: String::new(),
            funding_tx_hash,
            funding_tx_index,
            pk_script,
            value,
            spender,
            script_type: script_type.to_string(),
        }
    }

    /// The pre-seeded sentinel that coinbase inputs join against:
    /// all-zero funding hash, index `0xFFFFFFFF`.
    pub fn coinbase_sentinel() -> Self {
        Self::funding(
            Txid::all_zeros().to_string(),
            u32::MAX,
            String::new(),
            0,
            String::new(),
            ScriptType::Unknown,
        )
    }
}

/// The spending-face fields applied to an existing outpoint when an input
/// referencing it is indexed.
#[derive(Debug, Clone)]
pub struct SpendingFace {
    pub spending_tx_hash: String,
    pub spending_tx_index: u32,
    pub sequence: u32,
    pub signature_script: String,
    pub witness: String,
}

impl SpendingFace {
    /// Build the spending face for input `input_index` of `spending_txid`.
    pub fn from_input(spending_txid: &Txid, input_index: u32, input: &bitcoin::TxIn) -> Self {
        let witness = input
            .witness
            .iter()
            .map(|segment| segment.to_lower_hex_string())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            spending_tx_hash: spending_txid.to_string(),
            spending_tx_index: input_index,
            sequence: input.sequence.0,
            signature_script: format!("{:x}", input.script_sig),
            witness,
        }
    }
}
