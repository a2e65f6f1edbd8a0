//! Error types for the tether core.

use thiserror::Error;

/// Core errors for identity and record handling.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid item uri: {0}")]
    InvalidUri(String),

    #[error("invalid item path: {0}")]
    InvalidPath(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("payload exceeds limit: {size} > {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
}

pub type Result<T> = std::result::Result<T, CoreError>;
