//! # Tether Sync
//!
//! Wire protocol and session engine for converging data items and assets
//! between companion devices.
//!
//! ## Overview
//!
//! The sync crate turns raw duplex streams into sessions: framed CBOR
//! messages with digest checks, a handshake and watermark exchange on
//! every fresh link, and an engine actor that owns all mutable session
//! state and serializes every ledger write.
//!
//! ## Key Properties
//!
//! - **Idempotent**: re-delivering an applied item or asset changes nothing
//! - **Single-writer**: one actor task applies all mutations in order
//! - **Content-addressed**: asset bytes are verified against their digest
//!   before they become visible
//! - **Resumable**: a reconnect starts a fresh watermark exchange; nothing
//!   in-flight needs to survive the link
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tether_sync::{spawn_acceptor, spawn_supervisor, Engine, EngineConfig, TcpTransport};
//!
//! async fn example() {
//!     // Open storage and start the engine actor
//!     // let ledger = Ledger::open("tether.db").unwrap();
//!     // let content = ContentStore::open("assets").await.unwrap();
//!     // let handle = Engine::spawn(ledger.clone(), content, migrations, identity,
//!     //     EngineConfig::default());
//!
//!     // Accept inbound links and keep dialer configs connected
//!     // let transport = Arc::new(TcpTransport::bind("0.0.0.0:5601").await.unwrap());
//!     // spawn_acceptor(handle.clone(), transport.clone());
//!     // spawn_supervisor(handle, ledger, transport);
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- Connect ---------------->|
//!   |<------- Connect -----------------|
//!   |-------- SyncStart -------------->|
//!   |<------- SyncStart ---------------|
//!   |<------- SetAsset ----------------|
//!   |<------- FilePiece (xN) ----------|
//!   |-------- AckAsset --------------->|
//!   |<------- SetDataItem -------------|
//!   |-------- Heartbeat -------------->|
//!   |<------- Heartbeat ---------------|
//! ```

pub mod engine;
pub mod error;
pub mod events;
pub mod framing;
pub mod messages;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use engine::{Engine, EngineConfig, EngineHandle, LocalIdentity};
pub use error::{FramingError, Result, SyncError};
pub use events::{
    Event, EventFilter, EventKind, ListenerRegistry, Subscription, SubscriptionId,
    EVENT_QUEUE_DEPTH,
};
pub use messages::{limits, AssetRef, Message, SyncTableEntry, PROTOCOL_VERSION};
pub use session::{ConnectionId, PeerIdentity};
pub use supervisor::{spawn_acceptor, spawn_supervisor};
pub use transport::{
    memory::MemoryNetwork, memory::MemoryTransport, Duplex, TcpTransport, Transport, DEFAULT_PORT,
};
