//! Core library for **Magpie** — a restartable Bitcoin blockchain
//! indexer.
//!
//! This crate provides the reorg-aware chain store, the block-locator
//! index, peer discovery and sessions, and the sync engine that the
//! `magpie` binary builds on. It is intentionally backend-agnostic at
//! the document level: the [`store::Documents`] trait can be backed by
//! MongoDB, a mock, or any future document store.

pub mod chain;
pub mod error;
pub mod net;
pub mod params;
pub mod store;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{CoreError, NetworkError, ProtocolError, StorageError};
pub use sync::Indexer;
