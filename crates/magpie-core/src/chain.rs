//! Chain index helpers: block locators and checkpoint anchoring.
//!
//! A block locator is a descending, exponentially thinning list of
//! block hashes the remote peer uses to find the fork point between its
//! chain and ours. Checkpoints bound header requests to known-good
//! targets from the chain parameters.

use std::sync::Arc;

use bitcoin::BlockHash;

use crate::error::CoreError;
use crate::params::{ChainParams, Checkpoint};
use crate::store::Store;

// ==============================================================================
// Chain Index
// ==============================================================================

/// Locator and checkpoint queries over the persisted chain.
///
/// Walks are performed via repeated point lookups against the store;
/// no resident pointer graph is held in memory.
pub struct ChainIndex {
    store: Arc<Store>,
    params: ChainParams,
}

impl ChainIndex {
    pub fn new(store: Arc<Store>, params: ChainParams) -> Self {
        Self { store, params }
    }

    /// Compute the block locator for the chain ending at `height`.
    ///
    /// The sequence walks back from the tip with stride 1, doubling the
    /// stride after the first 10 entries, and always terminates with the
    /// hash at height 0. It is a pure function of the stored heights
    /// `0..=height`.
    pub async fn get_block_locator(&self, height: i32) -> Result<Vec<BlockHash>, CoreError> {
        let capacity = if height <= 12 {
            (height + 1).max(0) as usize
        } else {
            12 + usize::from(fast_log2_floor(height as u32 - 10))
        };
        let mut locator = Vec::with_capacity(capacity);
        if height < 0 {
            return Ok(locator);
        }

        let mut cursor = height;
        let mut step: i32 = 1;
        loop {
            locator.push(self.store.get_block_hash_by_height(cursor).await?);
            if cursor == 0 {
                break;
            }
            cursor -= step;
            if cursor < 0 {
                cursor = 0;
            }
            // Exponential thinning once the recent window is covered.
            if locator.len() > 10 {
                step *= 2;
            }
        }
        Ok(locator)
    }

    /// The chain's earliest hard-coded checkpoint strictly above
    /// `height`, or `None` once the caller is past the final checkpoint.
    pub fn find_next_header_checkpoint(&self, height: i32) -> Option<&Checkpoint> {
        self.params
            .checkpoints()
            .iter()
            .find(|checkpoint| checkpoint.height > height)
    }
}

// ==============================================================================
// Log2 Floor
// ==============================================================================

/// Branchless-ish floor(log2(n)) via a bitmask cascade.
pub(crate) fn fast_log2_floor(n: u32) -> u8 {
    const MASKS: [u32; 5] = [0xFFFF_0000, 0xFF00, 0xF0, 0xC, 0x2];
    let mut n = n;
    let mut result: u8 = 0;
    let mut exponent: u8 = 16;
    for mask in MASKS {
        if n & mask != 0 {
            result += exponent;
            n >>= exponent;
        }
        exponent >>= 1;
    }
    result
}
