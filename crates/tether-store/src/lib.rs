//! # Tether Store
//!
//! Persistence for the tether data layer. The [`Ledger`] keeps the
//! materialized latest state of every data item, per-node sequence
//! bookkeeping, asset presence and access grants, and connection
//! configurations in SQLite; the [`ContentStore`] keeps asset blobs on
//! disk, keyed by digest.
//!
//! ## Overview
//!
//! The ledger holds exactly one row per (application, host, path) and
//! overwrites it in place, so replication never replays history - a peer
//! that fell behind receives only the latest state of each item. Asset
//! bytes live outside the database; the ledger only tracks which digests
//! are present and which items are still waiting on one.
//!
//! ## Key Types
//!
//! - [`Ledger`] - SQLite-backed materialized item state
//! - [`ApplyResult`] - outcome of applying a record to the ledger
//! - [`ContentStore`] - file-backed content-addressed blob storage
//! - [`StagedAsset`] - an in-flight asset byte stream
//! - [`ConnectionConfig`] / [`ConfigRole`] - persisted peer endpoints
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tether_store::{ContentStore, Ledger};
//!
//! async fn example() {
//!     // Open the ledger database
//!     let ledger = Ledger::open("tether.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let ledger = Ledger::open_memory().unwrap();
//!
//!     // Blobs live next to it on disk
//!     let content = ContentStore::open("data").await.unwrap();
//!
//!     let _ = (ledger, content);
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Overwrite in place**: one row per (application, host, path);
//!   history is never kept, only the latest state
//! - **Replay safe**: a record from the same source at an equal or older
//!   sequence is reported as stale and leaves the row untouched
//! - **Derived readiness**: an item is ready iff every referenced asset is
//!   locally present; computed in SQL through the `item_state` view,
//!   never stored
//! - **Commit by rename**: asset blobs become visible only after their
//!   digest verifies against the announced one

pub mod config;
pub mod content;
pub mod error;
pub mod ledger;
pub mod migration;

pub use config::{ConfigRole, ConnectionConfig};
pub use content::{ContentStore, StagedAsset};
pub use error::{Result, StoreError};
pub use ledger::{ApplyResult, Ledger};
