//! End-to-end convergence between two data layer nodes over the
//! in-memory transport.
//!
//! Every scenario drives full nodes (ledger, content store, engine,
//! supervisor) and observes only the public API: events, queries, and
//! asset reads.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use tether::{
    AppKey, ClaimKind, ConnectionConfig, DataLayer, DataLayerError, Event, EventFilter, EventKind,
    MemoryNetwork, NodeConfig, NodeId, PutRequest, Subscription,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn app() -> AppKey {
    AppKey::new("com.example.weather", "sig-1")
}

struct Node {
    layer: DataLayer,
    _dir: TempDir,
}

async fn node(network: &Arc<MemoryNetwork>, name: &str, address: &str) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let mut config = NodeConfig::new(name, dir.path());
    config.engine.reconnect_interval = Duration::from_millis(100);
    let transport = Arc::new(network.create_transport(address).await);
    let layer = DataLayer::start(config, transport).await.unwrap();
    Node { layer, _dir: dir }
}

async fn connect(dialer: &Node, name: &str, address: &str) {
    dialer
        .layer
        .upsert_config(&ConnectionConfig::dialer(name, "mem", address))
        .await
        .unwrap();
}

async fn next_event(sub: &mut Subscription) -> Event {
    tokio::time::timeout(Duration::from_secs(10), sub.events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_item_with_asset_converges() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = node(&network, "node-a", "addr-a").await;
    let b = node(&network, "node-b", "addr-b").await;
    let mut sub = b.layer.subscribe(EventFilter::all()).await.unwrap();
    connect(&a, "link-b", "addr-b").await;
    assert_eq!(next_event(&mut sub).await.kind(), EventKind::PeerConnected);

    let radar = vec![3u8; 30_000];
    let stored = a
        .layer
        .put_item(
            PutRequest::new(app(), "/weather/today")
                .payload(b"sunny".to_vec())
                .asset("radar", radar.clone()),
        )
        .await
        .unwrap();
    let digest = *stored.assets.get("radar").unwrap();

    match next_event(&mut sub).await {
        Event::DataChanged { record } => {
            assert_eq!(record.payload.as_deref(), Some(&b"sunny"[..]));
            assert!(record.assets_ready);
            assert_eq!(record.assets.get("radar"), Some(&digest));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let held = b
        .layer
        .get_item(&app(), &NodeId::from("node-a"), "/weather/today")
        .await
        .unwrap()
        .expect("item not replicated");
    assert_eq!(held.seq, stored.seq);
    assert_eq!(b.layer.read_asset(&app(), &digest).await.unwrap(), radar);

    // Deletion crosses as a tombstone.
    let deleted = a
        .layer
        .delete_items(app(), None, "/weather/today", false)
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    loop {
        if let Event::DataChanged { record } = next_event(&mut sub).await {
            if record.deleted {
                break;
            }
        }
    }
    let gone = b
        .layer
        .get_item(&app(), &NodeId::from("node-a"), "/weather/today")
        .await
        .unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
async fn test_offline_history_collapses_to_latest() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = node(&network, "node-a", "addr-a").await;

    // Authored before any link exists; the second write supersedes the
    // first in place.
    a.layer
        .put_item(PutRequest::new(app(), "/settings/theme").payload(b"light".to_vec()))
        .await
        .unwrap();
    a.layer
        .put_item(PutRequest::new(app(), "/settings/theme").payload(b"dark".to_vec()))
        .await
        .unwrap();
    let alarm = a
        .layer
        .put_item(PutRequest::new(app(), "/settings/alarm").payload(b"07:30".to_vec()))
        .await
        .unwrap();
    assert_eq!(alarm.seq, 3);

    let b = node(&network, "node-b", "addr-b").await;
    let mut sub = b.layer.subscribe(EventFilter::all()).await.unwrap();
    connect(&b, "link-a", "addr-a").await;

    let mut theme = None;
    let mut alarm_seen = false;
    for _ in 0..3 {
        if let Event::DataChanged { record } = next_event(&mut sub).await {
            match record.uri.path() {
                "/settings/theme" => theme = record.payload.clone(),
                "/settings/alarm" => alarm_seen = true,
                other => panic!("unexpected path {other}"),
            }
        }
    }
    // Only the latest theme state ever crossed the wire.
    assert_eq!(theme.as_deref(), Some(&b"dark"[..]));
    assert!(alarm_seen);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sub.events.try_recv().is_err());

    let items = b.layer.items_by_prefix(&app(), None, "/settings/").await.unwrap();
    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn test_capability_claims_replicate() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = node(&network, "node-a", "addr-a").await;
    let b = node(&network, "node-b", "addr-b").await;
    let mut sub = b.layer.subscribe(EventFilter::all()).await.unwrap();
    connect(&a, "link-b", "addr-b").await;
    assert_eq!(next_event(&mut sub).await.kind(), EventKind::PeerConnected);

    a.layer
        .add_capability(&app(), "voice input", ClaimKind::Dynamic)
        .await
        .unwrap();
    assert_eq!(next_event(&mut sub).await.kind(), EventKind::DataChanged);

    let holders = b
        .layer
        .nodes_for_capability(&app(), "voice input")
        .await
        .unwrap();
    assert_eq!(holders, vec![NodeId::from("node-a")]);

    // A second dynamic claim is a duplicate; upgrading to static is not.
    let err = a
        .layer
        .add_capability(&app(), "voice input", ClaimKind::Dynamic)
        .await
        .unwrap_err();
    assert!(matches!(err, DataLayerError::Caps(_)));
    a.layer
        .add_capability(&app(), "voice input", ClaimKind::Static)
        .await
        .unwrap();

    a.layer.remove_capability(&app(), "voice input").await.unwrap();
    loop {
        if let Event::DataChanged { record } = next_event(&mut sub).await {
            if record.deleted {
                break;
            }
        }
    }
    let holders = b
        .layer
        .nodes_for_capability(&app(), "voice input")
        .await
        .unwrap();
    assert!(holders.is_empty());

    let err = a
        .layer
        .remove_capability(&app(), "voice input")
        .await
        .unwrap_err();
    assert!(matches!(err, DataLayerError::Caps(_)));
}

#[tokio::test]
async fn test_rpc_round_trip() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = node(&network, "node-a", "addr-a").await;
    let b = node(&network, "node-b", "addr-b").await;
    let mut a_sub = a.layer.subscribe(EventFilter::all()).await.unwrap();
    let mut b_sub = b
        .layer
        .subscribe(EventFilter {
            app: Some(app()),
            kinds: vec![EventKind::MessageReceived],
            path_prefix: "/player/".into(),
        })
        .await
        .unwrap();
    connect(&a, "link-b", "addr-b").await;
    assert_eq!(next_event(&mut a_sub).await.kind(), EventKind::PeerConnected);

    let id = a
        .layer
        .send_message(app(), NodeId::from("node-b"), "/player/play", b"track-7".to_vec())
        .await
        .unwrap();
    match next_event(&mut b_sub).await {
        Event::MessageReceived {
            source,
            path,
            payload,
            request_id,
            ..
        } => {
            assert_eq!(source.as_str(), "node-a");
            assert_eq!(path, "/player/play");
            assert_eq!(payload, b"track-7");
            assert_eq!(request_id, id);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // A second send on the same path advances the id.
    let id2 = a
        .layer
        .send_message(app(), NodeId::from("node-b"), "/player/play", b"track-8".to_vec())
        .await
        .unwrap();
    assert!(id2 > id);

    let err = a
        .layer
        .send_message(app(), NodeId::from("node-z"), "/player/play", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DataLayerError::Sync(_)));
}

#[tokio::test]
async fn test_oversize_payload_rejected() {
    let network = MemoryNetwork::new();
    let a = node(&network, "node-a", "addr-a").await;
    let err = a
        .layer
        .put_item(PutRequest::new(app(), "/big").payload(vec![0u8; 100 * 1024 + 1]))
        .await
        .unwrap_err();
    assert!(matches!(err, DataLayerError::Core(_)));

    let err = a
        .layer
        .send_message(
            app(),
            NodeId::from("node-b"),
            "/big",
            vec![0u8; 100 * 1024 + 1],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DataLayerError::Core(_)));
}

#[tokio::test]
async fn test_asset_reads_require_grant() {
    init_tracing();
    let network = MemoryNetwork::new();
    let a = node(&network, "node-a", "addr-a").await;
    let stored = a
        .layer
        .put_item(PutRequest::new(app(), "/gallery/1").asset("photo", b"jpeg bytes".to_vec()))
        .await
        .unwrap();
    let digest = *stored.assets.get("photo").unwrap();

    assert_eq!(
        a.layer.read_asset(&app(), &digest).await.unwrap(),
        b"jpeg bytes".to_vec()
    );

    let stranger = AppKey::new("com.example.other", "sig-9");
    let err = a.layer.read_asset(&stranger, &digest).await.unwrap_err();
    assert!(matches!(err, DataLayerError::AssetAccessDenied { .. }));
}

#[tokio::test]
async fn test_restart_backfills_missed_items() {
    init_tracing();
    let network = MemoryNetwork::new();
    let b = node(&network, "node-b", "addr-b").await;
    let mut b_sub = b.layer.subscribe(EventFilter::all()).await.unwrap();
    let a_dir = tempfile::tempdir().unwrap();

    // First life: connect, author one item, shut down.
    {
        let mut config = NodeConfig::new("node-a", a_dir.path());
        config.engine.reconnect_interval = Duration::from_millis(100);
        let transport = Arc::new(network.create_transport("addr-a").await);
        let a = DataLayer::start(config, transport).await.unwrap();
        connect_layer(&a, "link-b", "addr-b").await;

        a.put_item(PutRequest::new(app(), "/log/1").payload(b"first".to_vec()))
            .await
            .unwrap();

        assert_eq!(next_event(&mut b_sub).await.kind(), EventKind::PeerConnected);
        assert_eq!(next_event(&mut b_sub).await.kind(), EventKind::DataChanged);
        a.shutdown().await;
    }
    assert_eq!(
        next_event(&mut b_sub).await.kind(),
        EventKind::PeerDisconnected
    );

    // Authored while the peer is down.
    b.layer
        .put_item(PutRequest::new(app(), "/note/1").payload(b"while away".to_vec()))
        .await
        .unwrap();
    assert_eq!(next_event(&mut b_sub).await.kind(), EventKind::DataChanged);

    // Second life: same directory, same identity. The persisted dialer
    // config reconnects on its own; watermarks ensure only the missed
    // item crosses.
    let mut config = NodeConfig::new("node-a", a_dir.path());
    config.engine.reconnect_interval = Duration::from_millis(100);
    let transport = Arc::new(network.create_transport("addr-a").await);
    let a = DataLayer::start(config, transport).await.unwrap();
    let mut a_sub = a.subscribe(EventFilter::all()).await.unwrap();

    assert_eq!(next_event(&mut a_sub).await.kind(), EventKind::PeerConnected);
    match next_event(&mut a_sub).await {
        Event::DataChanged { record } => {
            assert_eq!(record.uri.path(), "/note/1");
            assert_eq!(record.source.as_str(), "node-b");
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Our own first-life item survived the restart.
    let log = a
        .get_item(&app(), &NodeId::from("node-a"), "/log/1")
        .await
        .unwrap();
    assert!(log.is_some());

    // Nothing already held crossed again.
    assert_eq!(next_event(&mut b_sub).await.kind(), EventKind::PeerConnected);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b_sub.events.try_recv().is_err());
}

async fn connect_layer(layer: &DataLayer, name: &str, address: &str) {
    layer
        .upsert_config(&ConnectionConfig::dialer(name, "mem", address))
        .await
        .unwrap();
}
