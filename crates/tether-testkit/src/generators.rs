//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use proptest::prelude::*;

use tether_core::{AppKey, DataItemRecord, Digest, ItemUri, NodeId};

/// Generate a random node id.
pub fn node_id() -> impl Strategy<Value = NodeId> {
    "[a-z0-9][a-z0-9-]{3,15}".prop_map(NodeId::from)
}

/// Generate an application key.
pub fn app_key() -> impl Strategy<Value = AppKey> {
    ("[a-z]{3,8}(\\.[a-z]{3,8}){1,2}", "[0-9a-f]{8}")
        .prop_map(|(package, signature)| AppKey::new(package, signature))
}

/// Generate a well-formed item path.
pub fn item_path() -> impl Strategy<Value = String> {
    "(/[a-z0-9_-]{1,10}){1,4}".prop_map(String::from)
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate a random digest.
pub fn digest() -> impl Strategy<Value = Digest> {
    any::<[u8; 32]>().prop_map(Digest::from_bytes)
}

/// Generate named asset references.
pub fn assets(max: usize) -> impl Strategy<Value = BTreeMap<String, Digest>> {
    prop::collection::btree_map("[a-z]{1,8}", digest(), 0..=max)
}

/// Generate a sequence number.
pub fn seq() -> impl Strategy<Value = i64> {
    1i64..=1_000_000
}

/// Generate a reasonable timestamp.
pub fn timestamp() -> impl Strategy<Value = i64> {
    0i64..=1_900_000_000_000
}

/// Parameters for generating a data item record.
#[derive(Debug, Clone)]
pub struct RecordParams {
    pub app: AppKey,
    pub host: NodeId,
    pub path: String,
    pub payload: Option<Vec<u8>>,
    pub assets: BTreeMap<String, Digest>,
    pub source: NodeId,
    pub seq: i64,
    pub last_modified: i64,
}

impl Arbitrary for RecordParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            app_key(),
            node_id(),
            item_path(),
            prop::option::of(payload(500)),
            assets(4),
            node_id(),
            seq(),
            timestamp(),
        )
            .prop_map(
                |(app, host, path, payload, assets, source, seq, last_modified)| RecordParams {
                    app,
                    host,
                    path,
                    payload,
                    assets,
                    source,
                    seq,
                    last_modified,
                },
            )
            .boxed()
    }
}

/// Build a record from parameters.
pub fn record_from_params(params: &RecordParams) -> DataItemRecord {
    let uri = ItemUri::new(params.host.clone(), params.path.clone())
        .expect("generated path is well formed");
    let mut record = DataItemRecord::new(params.app.clone(), uri, params.payload.clone());
    record.assets = params.assets.clone();
    record.source = params.source.clone();
    record.seq = params.seq;
    record.last_modified = params.last_modified;
    record
}
