//! Shared test helpers for `magpie-core` unit tests.
//!
//! Consolidates builder functions for blocks and transactions so that
//! tests across modules share a single source of truth for dummy data
//! construction. Hashes are real double-SHA256 block hashes (distinct
//! nonces give distinct blocks); no proof of work is implied.

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, Witness,
};

// ==============================================================================
// Hash Helpers
// ==============================================================================

/// Create a deterministic `Txid` from a single distinguishing byte.
pub fn txid_from_byte(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

/// Create a deterministic `BlockHash` from a single distinguishing byte.
pub fn block_hash_from_byte(b: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    BlockHash::from_byte_array(bytes)
}

// ==============================================================================
// Block Builders
// ==============================================================================

/// Build a block on top of `prev` carrying the given transactions.
/// The nonce only needs to make sibling test blocks distinct.
pub fn make_block_with_txs(prev: BlockHash, nonce: u32, txdata: Vec<Transaction>) -> Block {
    Block {
        header: Header {
            version: BlockVersion::from_consensus(2),
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000,
            bits: CompactTarget::from_consensus(0x1d00_ffff),
            nonce,
        },
        txdata,
    }
}

/// An empty block on top of `prev`.
pub fn make_block(prev: BlockHash, nonce: u32) -> Block {
    make_block_with_txs(prev, nonce, Vec::new())
}

// ==============================================================================
// Transaction Builders
// ==============================================================================

/// Minimal valid P2WPKH scriptPubKey: OP_0 PUSH20 <20-byte-hash>.
pub fn p2wpkh_script() -> ScriptBuf {
    let script_bytes = [
        0x00, 0x14, // OP_0, PUSH20
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f, 0x10, 0x11, 0x12, 0x13, 0x14,
    ];
    ScriptBuf::from_bytes(script_bytes.to_vec())
}

/// A coinbase transaction: one null-prevout input, one P2WPKH output.
pub fn coinbase_tx(sats: u64) -> Transaction {
    Transaction {
        version: TxVersion::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(vec![0x51]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: p2wpkh_script(),
        }],
    }
}

/// A transaction spending `funding_txid:vout` into a fresh P2WPKH
/// output, with a two-segment witness stack.
pub fn spend_tx(funding_txid: Txid, vout: u32, sats: u64) -> Transaction {
    let mut witness = Witness::new();
    witness.push([0x30, 0x01]);
    witness.push([0x02, 0xFF]);
    Transaction {
        version: TxVersion::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(funding_txid, vout),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness,
        }],
        output: vec![TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: p2wpkh_script(),
        }],
    }
}
