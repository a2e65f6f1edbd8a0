//! Error types for the sync engine.

use thiserror::Error;

/// Errors in the framing layer.
///
/// Every framing error is fatal to the connection that produced it: the
/// byte stream can no longer be trusted to carry frame boundaries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// A piece or reassembled body did not hash to the declared digest.
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    /// A piece arrived out of sequence for its reassembly queue.
    #[error("out-of-order piece on queue {queue_id}: expected {expected}, got {got}")]
    OutOfOrder { queue_id: u32, expected: u32, got: u32 },

    /// A frame or reassembled message exceeded the size ceiling.
    #[error("oversize frame: {size} bytes exceeds cap of {cap}")]
    Oversize { size: usize, cap: usize },

    /// A frame did not decode as a piece.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Framing failure. The connection is torn down.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Malformed or unexpected message. The message is skipped; the
    /// connection stays open.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// I/O failure on the transport. The connection is torn down.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Ledger or content store operation failed.
    #[error("store error: {0}")]
    Store(#[from] tether_store::StoreError),

    /// Identity or record handling failed.
    #[error("core error: {0}")]
    Core(#[from] tether_core::CoreError),

    /// Timeout waiting for the peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// No active connection to the target node.
    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    /// The engine task has stopped and no longer accepts commands.
    #[error("engine stopped")]
    EngineStopped,
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::TransportFailure(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
