//! # Tether
//!
//! The unified API for the tether data layer - synchronized items,
//! content-addressed assets, and capability claims between companion
//! devices.
//!
//! ## Overview
//!
//! A [`DataLayer`] node keeps a small relational store of application
//! data items eventually consistent with its peers over intermittent
//! links:
//!
//! - **Items**: keyed by (application, host node, path), last-writer-wins
//! - **Assets**: binary blobs keyed by digest, verified before visible
//! - **Messages**: fire-and-forget RPC to a directly connected peer
//! - **Capabilities**: named feature claims replicated as items
//!
//! ## Key Concepts
//!
//! - **Host**: the node that authored an item; part of its identity.
//! - **Watermark**: highest sequence already seen per authoring node;
//!   reconnects exchange watermarks and push only the difference.
//! - **Tombstone**: deletions persist as flagged rows so they replicate.
//! - **Readiness**: an item surfaces only once every referenced asset is
//!   locally present.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tether::{AppKey, ClaimKind, DataLayer, NodeConfig, PutRequest, TcpTransport};
//!
//! async fn example() {
//!     let transport = Arc::new(TcpTransport::bind("0.0.0.0:5601").await.unwrap());
//!     let layer = DataLayer::start(NodeConfig::new("phone-1", "/var/lib/tether"), transport)
//!         .await
//!         .unwrap();
//!
//!     let app = AppKey::new("com.example.weather", "a1b2c3");
//!     layer
//!         .put_item(
//!             PutRequest::new(app.clone(), "/weather/today")
//!                 .payload(b"sunny".to_vec())
//!                 .asset("radar", b"...png...".to_vec()),
//!         )
//!         .await
//!         .unwrap();
//!
//!     layer
//!         .add_capability(&app, "weather-display", ClaimKind::Static)
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! The component crates are re-exported for direct access:
//!
//! - `tether::core` - identities, digests, records, uris
//! - `tether::store` - the ledger and the content store
//! - `tether::sync` - wire protocol, engine, transports
//! - `tether::caps` - capability claims and migration gating

pub mod error;
pub mod node;

// Re-export component crates
pub use tether_caps as caps;
pub use tether_core as core;
pub use tether_store as store;
pub use tether_sync as sync;

// Re-export main types for convenience
pub use error::{DataLayerError, Result};
pub use node::{DataLayer, NodeConfig, PutRequest};

// Re-export commonly used component types
pub use tether_caps::ClaimKind;
pub use tether_core::{AppKey, DataItemRecord, Digest, ItemUri, NodeId};
pub use tether_store::{ConfigRole, ConnectionConfig};
pub use tether_sync::{
    Event, EventFilter, EventKind, MemoryNetwork, PeerIdentity, Subscription, SubscriptionId,
    TcpTransport, Transport,
};
