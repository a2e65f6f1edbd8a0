//! Wire messages exchanged between connected nodes.
//!
//! Every framed envelope decodes to exactly one [`Message`] variant. The
//! codec is CBOR via `ciborium`; fragmenting into length-prefixed pieces
//! happens one layer below, in [`crate::framing`].

use serde::{Deserialize, Serialize};
use tether_core::{AppKey, DataItemRecord, Digest, NodeId};

use crate::error::{Result, SyncError};

/// Protocol version announced in `Connect` and `SyncStart`.
pub const PROTOCOL_VERSION: i32 = 2;

/// Watermark sent for the reserved cloud key in every sync table.
pub const CLOUD_WATERMARK: i64 = 1;

/// Value of `received_seq_id` in every outgoing `SyncStart`.
pub const RECEIVED_SEQ_NONE: i64 = -1;

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Handshake announcement. The first message on every fresh
    /// connection, sent by both sides before anything else.
    Connect {
        id: NodeId,
        name: String,
        network_id: String,
        device_id: String,
        version: i32,
    },

    /// Watermark table, sent exactly once per session right after the
    /// peer's `Connect` arrives. Never sent as a reply.
    SyncStart {
        received_seq_id: i64,
        version: i32,
        sync_table: Vec<SyncTableEntry>,
    },

    /// Latest materialized state of one data item.
    SetDataItem {
        package: String,
        signature: String,
        uri: String,
        seq: i64,
        deleted: bool,
        last_modified: i64,
        source: NodeId,
        payload: Option<Vec<u8>>,
        assets: Vec<AssetRef>,
    },

    /// Asset announcement: digest plus access grants, optionally with the
    /// bytes inline. `has_asset` says whether the sender holds the blob
    /// and can answer a `FetchAsset` for it.
    SetAsset {
        digest: Digest,
        data: Option<Vec<u8>>,
        has_asset: bool,
        app_keys: Vec<AppKey>,
    },

    /// Ask the peer to stream an asset it holds.
    FetchAsset {
        digest: Digest,
        package: String,
        signature: String,
        permission: String,
    },

    /// Confirmation that an asset arrived and verified.
    AckAsset { digest: Digest },

    /// One chunk of an asset byte stream. The last chunk carries the
    /// digest the receiver must verify the accumulated bytes against.
    FilePiece {
        stream_id: String,
        last_piece: bool,
        bytes: Vec<u8>,
        digest: Option<Digest>,
    },

    /// RPC-style application message, routed by target node id.
    Request {
        target: NodeId,
        source: NodeId,
        path: String,
        payload: Vec<u8>,
        package: String,
        signature: String,
        request_id: i32,
        generation: i32,
    },

    /// Keepalive. Carries nothing; the read itself is the liveness
    /// signal.
    Heartbeat,
}

/// One `(node key, watermark)` row in a `SyncStart` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTableEntry {
    pub key: NodeId,
    pub value: i64,
}

/// A named asset reference inside `SetDataItem`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub key: String,
    pub digest: Digest,
}

/// Size limits enforced on messages.
pub mod limits {
    /// Ceiling on a single framed piece, and on a reassembled message.
    pub const MAX_PIECE_SIZE: usize = 64 * 1024 * 1024;

    /// Encoded message bodies larger than this are split into pieces.
    pub const SPLIT_THRESHOLD: usize = 512 * 1024;

    /// Fixed chunk size for streamed asset bytes.
    pub const ASSET_CHUNK_SIZE: usize = 12_215;

    /// Maximum payload of one data item.
    pub const MAX_ITEM_PAYLOAD: usize = 100 * 1024;

    /// Maximum asset references on one data item.
    pub const MAX_ASSETS_PER_ITEM: usize = 128;

    /// Maximum inline asset bytes accepted in a `SetAsset`.
    pub const MAX_INLINE_ASSET: usize = 4 * 1024 * 1024;

    /// Maximum access grants carried by one `SetAsset`.
    pub const MAX_ACL_KEYS: usize = 64;

    /// Maximum bytes in one `FilePiece` chunk.
    pub const MAX_FILE_PIECE: usize = 1024 * 1024;

    /// Maximum payload of one `Request`.
    pub const MAX_REQUEST_PAYLOAD: usize = 100 * 1024;

    /// Maximum rows in a sync table.
    pub const MAX_SYNC_TABLE: usize = 1024;

    /// Maximum display name length in `Connect`.
    pub const MAX_DISPLAY_NAME: usize = 256;
}

impl Message {
    /// Short variant name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "Connect",
            Message::SyncStart { .. } => "SyncStart",
            Message::SetDataItem { .. } => "SetDataItem",
            Message::SetAsset { .. } => "SetAsset",
            Message::FetchAsset { .. } => "FetchAsset",
            Message::AckAsset { .. } => "AckAsset",
            Message::FilePiece { .. } => "FilePiece",
            Message::Request { .. } => "Request",
            Message::Heartbeat => "Heartbeat",
        }
    }

    /// Build a `SetDataItem` carrying a record's materialized state.
    /// Tombstones go out without asset references even though the local
    /// row keeps them.
    pub fn set_data_item(record: &DataItemRecord) -> Self {
        let assets = if record.deleted {
            Vec::new()
        } else {
            record
                .assets
                .iter()
                .map(|(key, digest)| AssetRef {
                    key: key.clone(),
                    digest: *digest,
                })
                .collect()
        };

        Message::SetDataItem {
            package: record.app.package.clone(),
            signature: record.app.signature.clone(),
            uri: record.uri.to_string(),
            seq: record.seq,
            deleted: record.deleted,
            last_modified: record.last_modified,
            source: record.source.clone(),
            payload: record.payload.clone(),
            assets,
        }
    }

    /// Serialize with the wire codec.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SyncError::ProtocolViolation(format!("encode failed: {e}")))?;
        Ok(buf)
    }

    /// Deserialize from the wire codec.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes)
            .map_err(|e| SyncError::ProtocolViolation(format!("decode failed: {e}")))
    }

    /// Validate size limits before sending or after decoding.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            Message::Connect { name, .. } => {
                if name.len() > limits::MAX_DISPLAY_NAME {
                    return Err("display name too long");
                }
            }
            Message::SyncStart { sync_table, .. } => {
                if sync_table.len() > limits::MAX_SYNC_TABLE {
                    return Err("sync table too large");
                }
            }
            Message::SetDataItem {
                payload, assets, ..
            } => {
                if let Some(payload) = payload {
                    if payload.len() > limits::MAX_ITEM_PAYLOAD {
                        return Err("item payload too large");
                    }
                }
                if assets.len() > limits::MAX_ASSETS_PER_ITEM {
                    return Err("too many asset references");
                }
            }
            Message::SetAsset { data, app_keys, .. } => {
                if let Some(data) = data {
                    if data.len() > limits::MAX_INLINE_ASSET {
                        return Err("inline asset too large");
                    }
                }
                if app_keys.len() > limits::MAX_ACL_KEYS {
                    return Err("too many access grants");
                }
            }
            Message::FilePiece { bytes, .. } => {
                if bytes.len() > limits::MAX_FILE_PIECE {
                    return Err("file piece too large");
                }
            }
            Message::Request { path, payload, .. } => {
                if path.is_empty() {
                    return Err("empty request path");
                }
                if payload.len() > limits::MAX_REQUEST_PAYLOAD {
                    return Err("request payload too large");
                }
            }
            Message::FetchAsset { .. } | Message::AckAsset { .. } | Message::Heartbeat => {}
        }
        Ok(())
    }
}
