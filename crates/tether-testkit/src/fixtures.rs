//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tempfile::TempDir;

use tether::{ConnectionConfig, DataLayer, NodeConfig};
use tether_caps::{claim_record, ClaimKind};
use tether_core::{AppKey, DataItemRecord, Digest, ItemUri, NodeId};
use tether_store::Ledger;
use tether_sync::MemoryNetwork;

/// The application key used across fixtures.
pub fn test_app() -> AppKey {
    AppKey::new("com.example.fixture", "sig-fixture")
}

/// A live record rooted at `host`, sequence already assigned.
pub fn sample_record(host: &str, path: &str, payload: &[u8]) -> DataItemRecord {
    let uri = ItemUri::new(NodeId::from(host), path).expect("fixture path is absolute");
    let mut record = DataItemRecord::new(test_app(), uri, Some(payload.to_vec()));
    record.source = NodeId::from(host);
    record.seq = 1;
    record
}

/// A dynamic capability claim held by `node`.
pub fn sample_claim(node: &str, name: &str) -> DataItemRecord {
    claim_record(test_app(), NodeId::from(node), name, ClaimKind::Dynamic)
        .expect("fixture claim is well formed")
}

/// Random asset bytes with their digest.
pub fn random_asset(len: usize) -> (Digest, Vec<u8>) {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    (Digest::of(&bytes), bytes)
}

/// A ledger backed by an in-memory database.
pub fn memory_ledger() -> Ledger {
    Ledger::open_memory().expect("in-memory ledger opens")
}

/// Two live data layer nodes joined over an in-memory network.
///
/// `left` dials `right`. Replication is asynchronous; poll with
/// [`eventually`] before asserting on converged state.
pub struct NodePair {
    pub left: DataLayer,
    pub right: DataLayer,
    _dirs: (TempDir, TempDir),
}

impl NodePair {
    /// Start both nodes with fast reconnect intervals and persist the
    /// dialer config on `left`.
    pub async fn start() -> NodePair {
        let network = MemoryNetwork::new();
        let (left, left_dir) = Self::node(&network, "left", "addr-left").await;
        let (right, right_dir) = Self::node(&network, "right", "addr-right").await;
        left.upsert_config(&ConnectionConfig::dialer("pair", "mem", "addr-right"))
            .await
            .expect("dialer config persists");
        NodePair {
            left,
            right,
            _dirs: (left_dir, right_dir),
        }
    }

    async fn node(
        network: &Arc<MemoryNetwork>,
        name: &str,
        address: &str,
    ) -> (DataLayer, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = NodeConfig::new(name, dir.path());
        config.engine.reconnect_interval = Duration::from_millis(100);
        let transport = Arc::new(network.create_transport(address).await);
        let layer = DataLayer::start(config, transport)
            .await
            .expect("node starts");
        (layer, dir)
    }
}

/// Poll `probe` until it reports true or ten seconds pass.
pub async fn eventually<F, Fut>(mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[cfg(test)]
mod tests {
    use tether::PutRequest;
    use tether_caps::Claim;

    use super::*;

    #[test]
    fn test_sample_record_shape() {
        let record = sample_record("node-a", "/status", b"ok");
        assert_eq!(record.uri.to_string(), "tether://node-a/status");
        assert_eq!(record.seq, 1);
        assert!(!record.deleted);
    }

    #[test]
    fn test_sample_claim_parses_back() {
        let record = sample_claim("node-a", "voice input");
        let claim = Claim::from_record(&record).expect("claim parses");
        assert_eq!(claim.name, "voice input");
        assert_eq!(claim.node, NodeId::from("node-a"));
    }

    #[test]
    fn test_random_assets_differ() {
        let (d1, b1) = random_asset(64);
        let (d2, b2) = random_asset(64);
        assert_ne!(d1, d2);
        assert_ne!(b1, b2);
        assert_eq!(d1, Digest::of(&b1));
    }

    #[tokio::test]
    async fn test_memory_ledger_assigns_sequence() {
        let ledger = memory_ledger();
        assert_eq!(ledger.next_seq().await.unwrap(), 1);
        assert_eq!(ledger.next_seq().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pair_converges() {
        let pair = NodePair::start().await;
        pair.left
            .put_item(PutRequest::new(test_app(), "/pair/x").payload(b"ping".to_vec()))
            .await
            .unwrap();

        let right = &pair.right;
        let arrived = eventually(|| {
            let app = test_app();
            async move {
                right
                    .get_item(&app, &NodeId::from("left"), "/pair/x")
                    .await
                    .unwrap()
                    .is_some()
            }
        })
        .await;
        assert!(arrived);
    }
}
