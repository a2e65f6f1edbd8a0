//! Connection supervision.
//!
//! Two background tasks keep links alive. The acceptor turns every
//! inbound transport stream into a session. The supervisor rescans
//! enabled dialer configurations on a fixed interval and dials any
//! without a live link. Dial claims go through the engine, so a
//! configuration is never dialed twice concurrently and never dialed
//! while its link is up.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use tether_store::{ConnectionConfig, Ledger};

use crate::engine::EngineHandle;
use crate::error::Result;
use crate::session::establish;
use crate::transport::Transport;

/// Accept inbound streams until the transport fails.
pub fn spawn_acceptor(handle: EngineHandle, transport: Arc<dyn Transport>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let stream = match transport.accept().await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::info!(error = %err, "acceptor stopped");
                    return;
                }
            };
            let hello = handle.connect_message();
            let config = handle.config();
            let commands = handle.commands();
            tokio::spawn(async move {
                if let Err(err) = establish(stream, hello, config, commands, None).await {
                    tracing::debug!(error = %err, "inbound session failed");
                }
            });
        }
    })
}

/// Dial every enabled dialer configuration that has no live link, then
/// again every reconnect interval.
pub fn spawn_supervisor(
    handle: EngineHandle,
    ledger: Ledger,
    transport: Arc<dyn Transport>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(handle.config().reconnect_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let configs = match ledger.enabled_dialers().await {
                Ok(configs) => configs,
                Err(err) => {
                    tracing::warn!(error = %err, "dialer scan failed");
                    continue;
                }
            };
            for config in configs {
                match handle.claim_dial(&config.name).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    // Engine gone; nothing left to supervise.
                    Err(_) => return,
                }
                let handle = handle.clone();
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    if let Err(err) = dial(&handle, transport.as_ref(), &config).await {
                        tracing::debug!(config = %config.name, error = %err, "dial failed");
                        handle.release_dial(&config.name).await;
                    }
                });
            }
        }
    })
}

/// Dial one configured address and run the session to completion. An
/// error means the session was never registered, so the caller must
/// give the dial claim back.
async fn dial(
    handle: &EngineHandle,
    transport: &dyn Transport,
    config: &ConnectionConfig,
) -> Result<()> {
    let stream = transport.dial(&config.address).await?;
    establish(
        stream,
        handle.connect_message(),
        handle.config(),
        handle.commands(),
        Some(config.name.clone()),
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use tether_caps::MigrationGate;
    use tether_core::NodeId;
    use tether_store::ContentStore;

    use crate::engine::{Engine, EngineConfig, LocalIdentity};
    use crate::events::{Event, EventFilter, EventKind, Subscription};
    use crate::transport::memory::MemoryNetwork;

    use super::*;

    async fn start(node: &str, config: EngineConfig) -> (EngineHandle, Ledger, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open_memory().unwrap();
        let content = ContentStore::open(dir.path()).await.unwrap();
        let identity = LocalIdentity {
            node: NodeId::from(node),
            display_name: format!("{node} device"),
            network_id: "net-test".into(),
            device_id: format!("{node}-hw"),
        };
        let handle = Engine::spawn(
            ledger.clone(),
            content,
            Arc::new(MigrationGate::new()),
            identity,
            config,
        );
        (handle, ledger, dir)
    }

    fn fast() -> EngineConfig {
        EngineConfig {
            reconnect_interval: Duration::from_millis(50),
            ..EngineConfig::default()
        }
    }

    async fn next_event(sub: &mut Subscription) -> Event {
        tokio::time::timeout(Duration::from_secs(5), sub.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_supervisor_dials_configured_peer() {
        let network = MemoryNetwork::new();
        let (b_handle, _b_ledger, _b_dir) = start("node-b", EngineConfig::default()).await;
        spawn_acceptor(
            b_handle.clone(),
            Arc::new(network.create_transport("addr-b").await),
        );

        let (a_handle, a_ledger, _a_dir) = start("node-a", fast()).await;
        a_ledger
            .upsert_config(&ConnectionConfig::dialer("watch", "mem", "addr-b"))
            .await
            .unwrap();
        let mut sub = a_handle.subscribe(EventFilter::all()).await.unwrap();
        spawn_supervisor(
            a_handle.clone(),
            a_ledger.clone(),
            Arc::new(network.create_transport("addr-a").await),
        );

        match next_event(&mut sub).await {
            Event::PeerConnected { node } => assert_eq!(node.as_str(), "node-b"),
            other => panic!("unexpected event {other:?}"),
        }

        // The handshake was written back to the configuration row.
        let stored = a_ledger.config("watch").await.unwrap().unwrap();
        assert_eq!(stored.node_id.as_str(), "node-b");
        assert!(stored.last_connected > 0);

        // The live link keeps the claim occupied.
        assert!(!a_handle.claim_dial("watch").await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_config_is_not_dialed() {
        let network = MemoryNetwork::new();
        let (b_handle, _b_ledger, _b_dir) = start("node-b", EngineConfig::default()).await;
        spawn_acceptor(
            b_handle.clone(),
            Arc::new(network.create_transport("addr-b").await),
        );

        let (a_handle, a_ledger, _a_dir) = start("node-a", fast()).await;
        let mut config = ConnectionConfig::dialer("watch", "mem", "addr-b");
        config.enabled = false;
        a_ledger.upsert_config(&config).await.unwrap();
        let mut sub = a_handle.subscribe(EventFilter::all()).await.unwrap();
        spawn_supervisor(
            a_handle.clone(),
            a_ledger.clone(),
            Arc::new(network.create_transport("addr-a").await),
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_dial_releases_claim() {
        let network = MemoryNetwork::new();
        let (a_handle, a_ledger, _a_dir) = start("node-a", fast()).await;
        a_ledger
            .upsert_config(&ConnectionConfig::dialer("watch", "mem", "addr-nowhere"))
            .await
            .unwrap();
        let supervisor = spawn_supervisor(
            a_handle.clone(),
            a_ledger.clone(),
            Arc::new(network.create_transport("addr-a").await),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        supervisor.abort();

        // Every failed dial gave its claim back, so a fresh claim
        // succeeds once the in-flight one resolves.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if a_handle.claim_dial("watch").await.unwrap() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "dial claim never released"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_acceptor_serves_manual_dialer() {
        let network = MemoryNetwork::new();
        let (a_handle, _a_ledger, _a_dir) = start("node-a", EngineConfig::default()).await;
        let mut sub = a_handle.subscribe(EventFilter::all()).await.unwrap();
        spawn_acceptor(
            a_handle.clone(),
            Arc::new(network.create_transport("addr-a").await),
        );

        let (b_handle, _b_ledger, _b_dir) = start("node-b", EngineConfig::default()).await;
        let dialer = network.create_transport("addr-b").await;
        let stream = dialer.dial("addr-a").await.unwrap();
        tokio::spawn(establish(
            stream,
            b_handle.connect_message(),
            b_handle.config(),
            b_handle.commands(),
            None,
        ));

        assert_eq!(next_event(&mut sub).await.kind(), EventKind::PeerConnected);
        let peers = a_handle.connected_nodes().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node.as_str(), "node-b");
    }
}
