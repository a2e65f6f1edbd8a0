//! Golden wire vectors for the message codec.
//!
//! These vectors pin the encoded form of representative messages so a
//! second implementation can be checked for byte-for-byte compatibility.

use serde::Serialize;
use tether_core::{AppKey, Digest, NodeId};
use tether_sync::messages::{CLOUD_WATERMARK, RECEIVED_SEQ_NONE};
use tether_sync::{AssetRef, Message, SyncTableEntry, PROTOCOL_VERSION};

/// A golden wire vector.
#[derive(Debug, Clone)]
pub struct WireVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    /// The message to encode.
    pub message: Message,
    /// Expected encoding (hex). Empty until pinned against a second
    /// implementation.
    pub expected_hex: &'static str,
}

/// Get all golden wire vectors.
pub fn all_vectors() -> Vec<WireVector> {
    vec![
        WireVector {
            name: "Connect handshake",
            message: Message::Connect {
                id: NodeId::from("node-a"),
                name: "Pixel Watch".into(),
                network_id: "net-7".into(),
                device_id: "00000000cafe0001".into(),
                version: PROTOCOL_VERSION,
            },
            expected_hex: "",
        },
        WireVector {
            name: "SyncStart with three-row table",
            message: Message::SyncStart {
                received_seq_id: RECEIVED_SEQ_NONE,
                version: PROTOCOL_VERSION,
                sync_table: vec![
                    SyncTableEntry {
                        key: NodeId::cloud(),
                        value: CLOUD_WATERMARK,
                    },
                    SyncTableEntry {
                        key: NodeId::from("node-a"),
                        value: 12,
                    },
                    SyncTableEntry {
                        key: NodeId::from("node-b"),
                        value: 0,
                    },
                ],
            },
            expected_hex: "",
        },
        WireVector {
            name: "SetDataItem with payload and one asset",
            message: Message::SetDataItem {
                package: "com.example.weather".into(),
                signature: "3082aa55".into(),
                uri: "tether://node-a/weather/today".into(),
                seq: 17,
                deleted: false,
                last_modified: 1_787_702_400_000, // 2026-08-26T00:00:00Z
                source: NodeId::from("node-a"),
                payload: Some(b"sunny".to_vec()),
                assets: vec![AssetRef {
                    key: "radar".into(),
                    digest: Digest::from_bytes([0x42; 32]),
                }],
            },
            expected_hex: "",
        },
        WireVector {
            name: "Tombstone SetDataItem",
            message: Message::SetDataItem {
                package: "com.example.weather".into(),
                signature: "3082aa55".into(),
                uri: "tether://node-a/weather/today".into(),
                seq: 18,
                deleted: true,
                last_modified: 1_787_702_401_000,
                source: NodeId::from("node-a"),
                payload: None,
                assets: Vec::new(),
            },
            expected_hex: "",
        },
        WireVector {
            name: "SetAsset announce without inline bytes",
            message: Message::SetAsset {
                digest: Digest::from_bytes([0x42; 32]),
                data: None,
                has_asset: true,
                app_keys: vec![AppKey::new("com.example.weather", "3082aa55")],
            },
            expected_hex: "",
        },
        WireVector {
            name: "Final FilePiece with verification digest",
            message: Message::FilePiece {
                stream_id: "a1b2c3d4".into(),
                last_piece: true,
                bytes: b"tail".to_vec(),
                digest: Some(Digest::from_bytes([0x42; 32])),
            },
            expected_hex: "",
        },
        WireVector {
            name: "Request for media control",
            message: Message::Request {
                target: NodeId::from("node-b"),
                source: NodeId::from("node-a"),
                path: "/player/play".into(),
                payload: b"track-7".to_vec(),
                package: "com.example.media".into(),
                signature: "3082bb66".into(),
                request_id: 5,
                generation: 1,
            },
            expected_hex: "",
        },
        WireVector {
            name: "Heartbeat",
            message: Message::Heartbeat,
            expected_hex: "",
        },
    ]
}

/// Hex encoding of a vector's wire form.
pub fn vector_hex(vector: &WireVector) -> String {
    hex::encode(vector.message.encode().expect("wire vectors encode"))
}

/// Verify all golden vectors against their pinned encodings.
///
/// Vectors with no pinned encoding always pass and report what they
/// currently produce.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    all_vectors()
        .iter()
        .map(|v| {
            let hex = vector_hex(v);
            let matches = v.expected_hex.is_empty() || hex == v.expected_hex;
            (v.name.to_string(), matches, hex)
        })
        .collect()
}

/// One row of the JSON vector dump.
#[derive(Debug, Serialize)]
pub struct VectorReport {
    pub name: String,
    pub kind: String,
    pub hex: String,
}

/// Dump every vector as pretty-printed JSON, for diffing against other
/// implementations.
pub fn vectors_json() -> String {
    let reports: Vec<VectorReport> = all_vectors()
        .iter()
        .map(|v| VectorReport {
            name: v.name.to_string(),
            kind: v.message.kind().to_string(),
            hex: vector_hex(v),
        })
        .collect();
    serde_json::to_string_pretty(&reports).expect("vector report serializes")
}
