//! Error types for magpie-core.

// ==============================================================================
// Storage Errors
// ==============================================================================

/// Structured errors from the document-store layer.
///
/// `NotFound` is a first-class variant because control flow depends on
/// it: an absent parent block means "drop the orphan", an absent tip
/// means "fresh store", and an absent funding outpoint is promoted to
/// [`CoreError::MissingOutPoint`] by the transaction writer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("document not found")]
    NotFound,

    #[error("duplicate document key: {0}")]
    DuplicateKey(String),

    #[error("document store transport: {0}")]
    Transport(#[source] mongodb::error::Error),

    #[error("invalid stored document: {0}")]
    InvalidDocument(String),
}

impl From<mongodb::error::Error> for StorageError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::{ErrorKind, WriteFailure};

        // Mongo reports unique-index violations as server error 11000.
        // Surface those as DuplicateKey so writers can treat re-offered
        // documents as already indexed instead of as transport failures.
        if let ErrorKind::Write(WriteFailure::WriteError(ref we)) = *err.kind {
            if we.code == 11000 {
                return StorageError::DuplicateKey(we.message.clone());
            }
        }
        StorageError::Transport(err)
    }
}

// ==============================================================================
// Network Errors
// ==============================================================================

/// Failures on the way to (or on) a peer connection.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("dns resolution failed for {seed}: {source}")]
    Resolve {
        seed: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial timed out after {0:?}")]
    DialTimeout(std::time::Duration),

    #[error("connection i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer disconnected")]
    Disconnected,

    #[error("no peers available")]
    NoPeers,
}

// ==============================================================================
// Protocol Errors
// ==============================================================================

/// Unexpected or malformed wire traffic. These tear down the offending
/// session; they never abort the engine.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("wire decode: {0}")]
    Decode(#[source] bitcoin::consensus::encode::Error),

    #[error("message magic {got} does not match network magic {want}")]
    WrongMagic {
        got: bitcoin::p2p::Magic,
        want: bitcoin::p2p::Magic,
    },

    #[error("frame payload of {0} bytes exceeds the protocol limit")]
    OversizedMessage(usize),

    #[error("peer protocol version {got} is older than minimum {min}")]
    ObsoleteVersion { got: u32, min: u32 },

    #[error("connected to self (nonce collision)")]
    SelfConnection,
}

// ==============================================================================
// Core Errors
// ==============================================================================

/// Top-level error type for the magpie-core crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A spending input references a funding outpoint the store has
    /// never seen. Coinbase inputs dodge this via the pre-seeded
    /// sentinel outpoint.
    #[error("input {spending_txid}:{input_index} references missing outpoint {funding_txid}:{funding_index}")]
    MissingOutPoint {
        spending_txid: bitcoin::Txid,
        input_index: u32,
        funding_txid: bitcoin::Txid,
        funding_index: u32,
    },

    #[error("chain parameters not configured on the store")]
    ChainCfgMissing,
}
