//! Error types for the data layer facade.

use thiserror::Error;

use tether_caps::CapsError;
use tether_core::{AppKey, CoreError, Digest};
use tether_store::StoreError;
use tether_sync::SyncError;

/// Errors surfaced by [`DataLayer`](crate::DataLayer) operations.
#[derive(Debug, Error)]
pub enum DataLayerError {
    /// Identity or uri error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync or session error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Capability claim error.
    #[error("capability error: {0}")]
    Caps(#[from] CapsError),

    /// Filesystem error while preparing the data directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The application holds no grant for the asset.
    #[error("{app} has no access to asset {digest}")]
    AssetAccessDenied { app: AppKey, digest: Digest },
}

/// Result type for data layer operations.
pub type Result<T> = std::result::Result<T, DataLayerError>;
