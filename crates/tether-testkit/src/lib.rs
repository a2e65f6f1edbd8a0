//! # Tether Testkit
//!
//! Testing utilities for the Tether data layer.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Wire vectors**: Known messages with stable encodings for cross-implementation verification
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: Helpers and paired live nodes for integration scenarios
//!
//! ## Wire Vectors
//!
//! Wire vectors pin the codec output for representative messages:
//!
//! ```rust
//! use tether_testkit::vectors::{all_vectors, vector_hex};
//!
//! for vector in all_vectors() {
//!     println!("{}: {}", vector.name, vector_hex(&vector));
//! }
//! ```
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use tether_sync::Message;
//! use tether_testkit::generators::{record_from_params, RecordParams};
//!
//! proptest! {
//!     #[test]
//!     fn wire_form_round_trips(params: RecordParams) {
//!         let record = record_from_params(&params);
//!         let msg = Message::set_data_item(&record);
//!         prop_assert_eq!(Message::decode(&msg.encode()?)?, msg);
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! Quickly set up test scenarios:
//!
//! ```rust
//! use tether_testkit::fixtures::sample_record;
//!
//! let record = sample_record("node-a", "/status", b"ok");
//! assert_eq!(record.uri.to_string(), "tether://node-a/status");
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{
    eventually, memory_ledger, random_asset, sample_claim, sample_record, test_app, NodePair,
};
pub use generators::{record_from_params, RecordParams};
pub use vectors::{all_vectors, vector_hex, vectors_json, verify_all_vectors, WireVector};
