//! Error types for the store crate.

use thiserror::Error;

/// Errors that can occur during ledger or content-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// An asset blob did not hash to the digest it was announced under.
    #[error("asset integrity failure: expected {expected}, computed {computed}")]
    AssetIntegrity { expected: String, computed: String },

    /// Asset blob not present in the content store.
    #[error("asset not present: {0}")]
    AssetNotPresent(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
