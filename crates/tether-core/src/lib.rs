//! # Tether Core
//!
//! Pure primitives for the tether data layer: node and application
//! identities, content digests, item URIs, and materialized data-item
//! records.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over identity and record types.
//!
//! ## Key Types
//!
//! - [`NodeId`] - Opaque stable identifier of a device
//! - [`AppKey`] - (package, signature digest) identity of an application
//! - [`Digest`] - Blake3 content digest, the identity of an asset
//! - [`ItemUri`] - `tether://<host>/<path>` location of a data item
//! - [`DataItemRecord`] - The materialized latest state of one item

pub mod digest;
pub mod error;
pub mod path;
pub mod record;
pub mod types;

pub use digest::{Digest, DigestHasher};
pub use error::{CoreError, Result};
pub use path::{ItemUri, URI_SCHEME};
pub use record::DataItemRecord;
pub use types::{now_millis, AppKey, NodeId};
