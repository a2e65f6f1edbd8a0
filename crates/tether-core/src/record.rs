//! Materialized data items.
//!
//! A [`DataItemRecord`] is the unit of synchronized state: the latest known
//! version of one item, as held by the ledger. There is never more than one
//! record per (application, host, path); replays and conflicts resolve by
//! REPLACE, last writer wins within each authoring node's sequence stream.

use std::collections::BTreeMap;

use crate::digest::Digest;
use crate::path::ItemUri;
use crate::types::{now_millis, AppKey, NodeId};

/// The latest materialized state of one data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItemRecord {
    /// Owning application.
    pub app: AppKey,

    /// Host-qualified location.
    pub uri: ItemUri,

    /// Opaque payload. `None` once the item is tombstoned.
    pub payload: Option<Vec<u8>>,

    /// Referenced assets, name → digest. Ordered for deterministic
    /// encoding.
    pub assets: BTreeMap<String, Digest>,

    /// Node that authored this mutation.
    pub source: NodeId,

    /// Sequence number within the source node's own stream.
    pub seq: i64,

    /// Tombstone flag. The row persists so the deletion can propagate.
    pub deleted: bool,

    /// Wall-clock milliseconds at write time. Advisory only.
    pub last_modified: i64,

    /// True iff every referenced asset is present in the local content
    /// store. Derived by the ledger; always true for tombstones.
    pub assets_ready: bool,
}

impl DataItemRecord {
    /// A fresh live record authored now. Sequence is assigned later, at
    /// write time.
    pub fn new(app: AppKey, uri: ItemUri, payload: Option<Vec<u8>>) -> Self {
        Self {
            app,
            uri,
            payload,
            assets: BTreeMap::new(),
            source: NodeId::new(""),
            seq: 0,
            deleted: false,
            last_modified: now_millis(),
            assets_ready: true,
        }
    }

    pub fn with_asset(mut self, name: impl Into<String>, digest: Digest) -> Self {
        self.assets.insert(name.into(), digest);
        self
    }

    /// Turn this record into its tombstone, re-authored by `source` at
    /// `seq`. The payload is cleared; asset references are kept so the
    /// tombstone row still names what it used to carry.
    pub fn into_tombstone(mut self, source: NodeId, seq: i64) -> Self {
        self.deleted = true;
        self.payload = None;
        self.assets_ready = true;
        self.source = source;
        self.seq = seq;
        self.last_modified = now_millis();
        self
    }

    /// Digests of every referenced asset.
    pub fn asset_digests(&self) -> impl Iterator<Item = &Digest> {
        self.assets.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataItemRecord {
        let app = AppKey::new("com.example.weather", "sig");
        let uri = ItemUri::new(NodeId::from("node-a"), "/weather/today").unwrap();
        DataItemRecord::new(app, uri, Some(b"sunny".to_vec()))
            .with_asset("icon", Digest::of(b"icon-bytes"))
    }

    #[test]
    fn test_tombstone_clears_payload_keeps_assets() {
        let record = sample().into_tombstone(NodeId::from("node-b"), 7);
        assert!(record.deleted);
        assert!(record.payload.is_none());
        assert!(record.assets_ready);
        assert_eq!(record.seq, 7);
        assert_eq!(record.source, NodeId::from("node-b"));
        assert_eq!(record.assets.len(), 1);
    }
}
