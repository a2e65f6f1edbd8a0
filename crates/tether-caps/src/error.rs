//! Error types for the capability module.

use thiserror::Error;

/// Errors that can occur during capability operations.
#[derive(Debug, Error)]
pub enum CapsError {
    /// The capability is already claimed and the claim cannot be replaced.
    #[error("duplicate capability: {0}")]
    DuplicateCapability(String),

    /// No live claim exists for the capability.
    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] tether_core::CoreError),
}

/// Result type for capability operations.
pub type Result<T> = std::result::Result<T, CapsError>;
