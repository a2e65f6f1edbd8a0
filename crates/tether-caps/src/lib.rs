//! # Tether Caps
//!
//! Capability claims and migration gating for the tether data layer.
//!
//! ## Overview
//!
//! A capability is a named feature a node advertises ("can play audio",
//! "handles navigation"). Claims are not a separate subsystem: each one is
//! a data item under the reserved `/capabilities/` prefix, so claims
//! replicate, tombstone, and conflict-resolve exactly like application
//! data. This module holds the pure rules - path encoding, claim
//! uniqueness, withdrawal - while the ledger stores the items.
//!
//! The [`MigrationGate`] is a small read-mostly switchboard consulted on
//! every data-changed delivery while a node identity migration is in
//! progress.
//!
//! ## Key Types
//!
//! - [`Claim`] / [`ClaimKind`] - a live capability claim and how it was
//!   made
//! - [`capability_path`] / [`capability_name`] - the reserved path scheme
//! - [`check_add`] / [`check_remove`] - claim uniqueness rules
//! - [`MigrationGate`] - per-(application, node) delivery gating
//!
//! ## Usage
//!
//! ```rust
//! use tether_caps::{capability_path, check_add, ClaimKind};
//!
//! // First dynamic claim is fine; a second one is a duplicate
//! assert!(check_add("playback", None, ClaimKind::Dynamic).is_ok());
//! assert!(check_add("playback", Some(ClaimKind::Dynamic), ClaimKind::Dynamic).is_err());
//!
//! assert_eq!(capability_path("playback"), "/capabilities/playback");
//! ```

pub mod claim;
pub mod error;
pub mod migration;

pub use claim::{
    capability_name, capability_path, check_add, check_remove, claim_record, Claim, ClaimKind,
    CAPABILITY_PREFIX,
};
pub use error::{CapsError, Result};
pub use migration::MigrationGate;
