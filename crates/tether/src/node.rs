//! The data layer node: unified API over storage, sync, and capabilities.
//!
//! A [`DataLayer`] owns one ledger, one content store, and one engine
//! actor, and keeps links to peers alive through the connection
//! supervisor. Applications talk to it and never to the parts directly.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;

use tether_caps::{
    capability_path, check_add, check_remove, claim_record, Claim, ClaimKind, MigrationGate,
};
use tether_core::{AppKey, CoreError, DataItemRecord, Digest, ItemUri, NodeId};
use tether_store::{ConnectionConfig, ContentStore, Ledger};
use tether_sync::{
    limits, spawn_acceptor, spawn_supervisor, Engine, EngineConfig, EngineHandle, EventFilter,
    LocalIdentity, PeerIdentity, Subscription, SubscriptionId, Transport,
};

use crate::error::{DataLayerError, Result};

/// Configuration for one data layer node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's identity on the wire.
    pub node: NodeId,
    /// Human-readable name announced in handshakes.
    pub display_name: String,
    /// Pairing-network identifier announced in handshakes.
    pub network_id: String,
    /// Hardware identifier announced in handshakes.
    pub device_id: String,
    /// Directory holding the ledger database and the content store.
    pub data_dir: PathBuf,
    /// Session and supervision timing.
    pub engine: EngineConfig,
}

impl NodeConfig {
    /// A configuration with generated device id and default timing.
    pub fn new(node: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        let node = NodeId::new(node);
        Self {
            display_name: node.as_str().to_string(),
            network_id: String::new(),
            device_id: format!("{:016x}", rand::random::<u64>()),
            data_dir: data_dir.into(),
            engine: EngineConfig::default(),
            node,
        }
    }
}

/// A pending local write, built up before [`DataLayer::put_item`].
#[derive(Debug, Clone)]
pub struct PutRequest {
    app: AppKey,
    path: String,
    payload: Option<Vec<u8>>,
    assets: BTreeMap<String, Vec<u8>>,
}

impl PutRequest {
    pub fn new(app: AppKey, path: impl Into<String>) -> Self {
        Self {
            app,
            path: path.into(),
            payload: None,
            assets: BTreeMap::new(),
        }
    }

    pub fn payload(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(bytes.into());
        self
    }

    /// Attach asset bytes under `name`. The digest is computed and the
    /// bytes committed when the request is put.
    pub fn asset(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.assets.insert(name.into(), bytes.into());
        self
    }
}

/// One running data layer node.
///
/// Provides a unified API for:
/// - Writing and querying synchronized data items
/// - Attaching and reading content-addressed assets
/// - RPC-style messages to connected peers
/// - Capability claims
/// - Event subscriptions and connection configuration
pub struct DataLayer {
    engine: EngineHandle,
    ledger: Ledger,
    content: ContentStore,
    migrations: Arc<MigrationGate>,
    local: NodeId,
    acceptor: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

impl DataLayer {
    /// Open storage under the configured data directory and start the
    /// engine, acceptor, and connection supervisor over `transport`.
    pub async fn start(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let ledger = Ledger::open(config.data_dir.join("ledger.db"))?;
        let content = ContentStore::open(config.data_dir.join("content")).await?;
        let migrations = Arc::new(MigrationGate::new());

        let identity = LocalIdentity {
            node: config.node.clone(),
            display_name: config.display_name,
            network_id: config.network_id,
            device_id: config.device_id,
        };
        let engine = Engine::spawn(
            ledger.clone(),
            content.clone(),
            Arc::clone(&migrations),
            identity,
            config.engine,
        );
        let acceptor = spawn_acceptor(engine.clone(), Arc::clone(&transport));
        let supervisor = spawn_supervisor(engine.clone(), ledger.clone(), transport);
        tracing::info!(node = %config.node, dir = %config.data_dir.display(), "data layer started");

        Ok(Self {
            engine,
            ledger,
            content,
            migrations,
            local: config.node,
            acceptor,
            supervisor,
        })
    }

    /// This node's identity.
    pub fn node(&self) -> &NodeId {
        &self.local
    }

    /// The migration gate consulted before data-changed delivery.
    pub fn migrations(&self) -> &MigrationGate {
        &self.migrations
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Item Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Write a data item hosted by this node and replicate it to every
    /// connected peer. Attached asset bytes are committed first, so the
    /// item is born ready locally.
    pub async fn put_item(&self, request: PutRequest) -> Result<DataItemRecord> {
        let PutRequest {
            app,
            path,
            payload,
            assets,
        } = request;
        if let Some(ref payload) = payload {
            if payload.len() > limits::MAX_ITEM_PAYLOAD {
                return Err(CoreError::PayloadTooLarge {
                    size: payload.len(),
                    limit: limits::MAX_ITEM_PAYLOAD,
                }
                .into());
            }
        }
        let uri = ItemUri::new(self.local.clone(), path)?;

        let mut digests = BTreeMap::new();
        for (name, bytes) in assets {
            let digest = Digest::of(&bytes);
            self.content.put(&digest, &bytes).await?;
            self.ledger.mark_asset_present(&digest).await?;
            digests.insert(name, digest);
        }
        Ok(self.engine.put_item(app, uri, payload, digests).await?)
    }

    /// The live item at (`app`, `host`, `path`), if any.
    pub async fn get_item(
        &self,
        app: &AppKey,
        host: &NodeId,
        path: &str,
    ) -> Result<Option<DataItemRecord>> {
        let uri = ItemUri::new(host.clone(), path)?;
        Ok(self.ledger.get_item(app, &uri).await?)
    }

    /// Live items under a path prefix, optionally narrowed to one host.
    pub async fn items_by_prefix(
        &self,
        app: &AppKey,
        host: Option<&NodeId>,
        prefix: &str,
    ) -> Result<Vec<DataItemRecord>> {
        Ok(self.ledger.items_by_prefix(app, host, prefix).await?)
    }

    /// Tombstone matching items and replicate the deletions. With
    /// `prefix` set, `path` deletes everything under it. Returns how many
    /// items were deleted.
    pub async fn delete_items(
        &self,
        app: AppKey,
        host: Option<NodeId>,
        path: &str,
        prefix: bool,
    ) -> Result<usize> {
        Ok(self
            .engine
            .delete_items(app, host, path.to_string(), prefix)
            .await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Asset Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Open a committed asset for reading. The application must hold a
    /// grant for the digest.
    pub async fn open_asset(&self, app: &AppKey, digest: &Digest) -> Result<tokio::fs::File> {
        if !self.ledger.has_asset_access(app, digest).await? {
            return Err(DataLayerError::AssetAccessDenied {
                app: app.clone(),
                digest: *digest,
            });
        }
        Ok(self.content.open_reader(digest).await?)
    }

    /// Read a committed asset into memory. Same access rules as
    /// [`open_asset`](Self::open_asset).
    pub async fn read_asset(&self, app: &AppKey, digest: &Digest) -> Result<Vec<u8>> {
        if !self.ledger.has_asset_access(app, digest).await? {
            return Err(DataLayerError::AssetAccessDenied {
                app: app.clone(),
                digest: *digest,
            });
        }
        Ok(self.content.read(digest).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messaging
    // ─────────────────────────────────────────────────────────────────────────

    /// Send an RPC-style message to a connected peer. Returns the request
    /// id the receiving application sees.
    pub async fn send_message(
        &self,
        app: AppKey,
        target: NodeId,
        path: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<i64> {
        if payload.len() > limits::MAX_REQUEST_PAYLOAD {
            return Err(CoreError::PayloadTooLarge {
                size: payload.len(),
                limit: limits::MAX_REQUEST_PAYLOAD,
            }
            .into());
        }
        Ok(self
            .engine
            .send_message(app, target, path.into(), payload)
            .await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Capability Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Claim a capability for `app` on this node and replicate the claim.
    pub async fn add_capability(
        &self,
        app: &AppKey,
        name: &str,
        kind: ClaimKind,
    ) -> Result<DataItemRecord> {
        let uri = ItemUri::new(self.local.clone(), capability_path(name))?;
        let existing = self.ledger.get_item(app, &uri).await?;
        let existing_kind = existing.as_ref().and_then(Claim::from_record).map(|c| c.kind);
        check_add(name, existing_kind, kind)?;

        let record = claim_record(app.clone(), self.local.clone(), name, kind)?;
        Ok(self
            .engine
            .put_item(record.app, record.uri, record.payload, BTreeMap::new())
            .await?)
    }

    /// Withdraw a capability claimed by `app` on this node.
    pub async fn remove_capability(&self, app: &AppKey, name: &str) -> Result<()> {
        let path = capability_path(name);
        let uri = ItemUri::new(self.local.clone(), path.clone())?;
        let existing = self.ledger.get_item(app, &uri).await?;
        let existing_kind = existing.as_ref().and_then(Claim::from_record).map(|c| c.kind);
        check_remove(name, existing_kind)?;

        self.engine
            .delete_items(app.clone(), Some(self.local.clone()), path, false)
            .await?;
        Ok(())
    }

    /// Every node currently holding a live claim for `name` under `app`,
    /// this node included.
    pub async fn nodes_for_capability(&self, app: &AppKey, name: &str) -> Result<Vec<NodeId>> {
        let items = self
            .ledger
            .items_at_path(app, &capability_path(name))
            .await?;
        Ok(items
            .iter()
            .filter_map(Claim::from_record)
            .map(|c| c.node)
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to data-changed, peer lifecycle, and message events
    /// matching `filter`.
    pub async fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        Ok(self.engine.subscribe(filter).await?)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        Ok(self.engine.unsubscribe(id).await?)
    }

    /// Identities of every currently connected peer.
    pub async fn connected_nodes(&self) -> Result<Vec<PeerIdentity>> {
        Ok(self.engine.connected_nodes().await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connection Configuration
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace a connection configuration. Enabled dialer rows
    /// are picked up on the supervisor's next scan.
    pub async fn upsert_config(&self, config: &ConnectionConfig) -> Result<()> {
        Ok(self.ledger.upsert_config(config).await?)
    }

    pub async fn config(&self, name: &str) -> Result<Option<ConnectionConfig>> {
        Ok(self.ledger.config(name).await?)
    }

    pub async fn configs(&self) -> Result<Vec<ConnectionConfig>> {
        Ok(self.ledger.configs().await?)
    }

    /// Enable or disable a configuration. Returns whether a row changed.
    pub async fn set_config_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        Ok(self.ledger.set_config_enabled(name, enabled).await?)
    }

    /// Delete a configuration. Returns whether a row existed.
    pub async fn remove_config(&self, name: &str) -> Result<bool> {
        Ok(self.ledger.delete_config(name).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop supervision, close every link, and stop the engine.
    pub async fn shutdown(self) {
        self.supervisor.abort();
        self.engine.shutdown().await;
        self.acceptor.abort();
        tracing::info!(node = %self.local, "data layer stopped");
    }
}
