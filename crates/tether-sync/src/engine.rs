//! The sync engine.
//!
//! One actor task owns every piece of mutable session state: the table of
//! live links, the listener registry, pending dial claims, and RPC id
//! allocation. Everything else talks to it through [`EngineHandle`] over a
//! command channel. Sessions hand their write half to the engine at
//! registration and keep only the read loop, so all outbound traffic for
//! a link is serialized by the actor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};

use tether_caps::MigrationGate;
use tether_core::{AppKey, DataItemRecord, Digest, ItemUri, NodeId};
use tether_store::{ApplyResult, ContentStore, Ledger, StagedAsset};

use crate::error::{Result, SyncError};
use crate::events::{Event, EventFilter, ListenerRegistry, Subscription, SubscriptionId};
use crate::messages::{
    limits, Message, SyncTableEntry, CLOUD_WATERMARK, PROTOCOL_VERSION, RECEIVED_SEQ_NONE,
};
use crate::session::{ConnectionId, PeerIdentity, PeerWriter};

/// Request ids wrap here; the generation then advances so combined ids
/// stay unique within a stream.
const MAX_REQUEST_ID: i32 = 0xFFFF;

/// Timing knobs for sessions and the engine loop.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// A link idle this long gets a heartbeat.
    pub heartbeat_interval: Duration,

    /// A link silent this long is considered dead.
    pub read_timeout: Duration,

    /// How long a fresh link may take to complete the handshake.
    pub handshake_timeout: Duration,

    /// How often the connection supervisor rescans dialer configs.
    pub reconnect_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            read_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(10),
        }
    }
}

/// What this node announces about itself in every handshake.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub node: NodeId,
    pub display_name: String,
    pub network_id: String,
    pub device_id: String,
}

/// Commands processed by the engine actor.
pub(crate) enum Command {
    PutItem {
        app: AppKey,
        uri: ItemUri,
        payload: Option<Vec<u8>>,
        assets: BTreeMap<String, Digest>,
        reply: oneshot::Sender<Result<DataItemRecord>>,
    },
    DeleteItems {
        app: AppKey,
        host: Option<NodeId>,
        path: String,
        prefix: bool,
        reply: oneshot::Sender<Result<usize>>,
    },
    SendMessage {
        app: AppKey,
        target: NodeId,
        path: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<i64>>,
    },
    Subscribe {
        filter: EventFilter,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    ConnectedNodes {
        reply: oneshot::Sender<Vec<PeerIdentity>>,
    },
    ClaimDial {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    ReleaseDial {
        name: String,
    },
    Register {
        conn: ConnectionId,
        peer: PeerIdentity,
        writer: PeerWriter,
        config_name: Option<String>,
    },
    Inbound {
        conn: ConnectionId,
        message: Message,
    },
    ConnectionLost {
        conn: ConnectionId,
    },
    Shutdown,
}

/// Cloneable client side of the engine actor.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    identity: LocalIdentity,
    config: EngineConfig,
}

impl EngineHandle {
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub(crate) fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    /// The handshake announcement sessions open with.
    pub(crate) fn connect_message(&self) -> Message {
        Message::Connect {
            id: self.identity.node.clone(),
            name: self.identity.display_name.clone(),
            network_id: self.identity.network_id.clone(),
            device_id: self.identity.device_id.clone(),
            version: PROTOCOL_VERSION,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Author or overwrite a data item and replicate it to every
    /// connected peer. Asset bytes must already be committed; `assets`
    /// carries only their digests.
    pub async fn put_item(
        &self,
        app: AppKey,
        uri: ItemUri,
        payload: Option<Vec<u8>>,
        assets: BTreeMap<String, Digest>,
    ) -> Result<DataItemRecord> {
        self.request(|reply| Command::PutItem {
            app,
            uri,
            payload,
            assets,
            reply,
        })
        .await?
    }

    /// Tombstone matching items. With `prefix` set, `path` deletes
    /// everything under it; otherwise only the exact path. Returns how
    /// many items were tombstoned.
    pub async fn delete_items(
        &self,
        app: AppKey,
        host: Option<NodeId>,
        path: String,
        prefix: bool,
    ) -> Result<usize> {
        self.request(|reply| Command::DeleteItems {
            app,
            host,
            path,
            prefix,
            reply,
        })
        .await?
    }

    /// Send an RPC-style message to a connected peer. Returns the request
    /// id also surfaced to the receiving application.
    pub async fn send_message(
        &self,
        app: AppKey,
        target: NodeId,
        path: String,
        payload: Vec<u8>,
    ) -> Result<i64> {
        self.request(|reply| Command::SendMessage {
            app,
            target,
            path,
            payload,
            reply,
        })
        .await?
    }

    pub async fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        self.request(|reply| Command::Subscribe { filter, reply }).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.commands
            .send(Command::Unsubscribe { id })
            .await
            .map_err(|_| SyncError::EngineStopped)
    }

    /// Identities of every currently connected peer.
    pub async fn connected_nodes(&self) -> Result<Vec<PeerIdentity>> {
        self.request(|reply| Command::ConnectedNodes { reply }).await
    }

    /// Try to claim the right to dial `name`. Refused while a dial is
    /// already pending or a link for that config is live.
    pub(crate) async fn claim_dial(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.request(|reply| Command::ClaimDial { name, reply }).await
    }

    /// Give back a dial claim that never produced a session.
    pub(crate) async fn release_dial(&self, name: &str) {
        let _ = self
            .commands
            .send(Command::ReleaseDial {
                name: name.to_string(),
            })
            .await;
    }

    /// Stop the engine, closing every link.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// One registered link.
struct Connection {
    peer: PeerIdentity,
    writer: PeerWriter,
    config_name: Option<String>,
    last_write: Instant,
    got_sync_start: bool,
    /// In-flight inbound asset streams, keyed by wire stream id.
    staged: HashMap<String, StagedAsset>,
}

/// Allocates request ids per (app, target, path) stream.
#[derive(Default)]
struct RpcTracker {
    streams: HashMap<(AppKey, NodeId, String), RpcStream>,
}

struct RpcStream {
    generation: i32,
    request_id: i32,
}

impl RpcTracker {
    fn next(&mut self, app: &AppKey, target: &NodeId, path: &str) -> (i32, i32) {
        let stream = self
            .streams
            .entry((app.clone(), target.clone(), path.to_string()))
            .or_insert(RpcStream {
                generation: 1,
                request_id: 0,
            });
        stream.request_id += 1;
        if stream.request_id > MAX_REQUEST_ID {
            stream.request_id = 1;
            stream.generation += 1;
        }
        (stream.generation, stream.request_id)
    }
}

/// The id surfaced to applications for one request.
fn combined_request_id(generation: i32, request_id: i32) -> i64 {
    (generation as i64 + 527) * 31 + request_id as i64
}

/// The engine actor. Built and started through [`Engine::spawn`].
pub struct Engine {
    ledger: Ledger,
    content: ContentStore,
    migrations: Arc<MigrationGate>,
    identity: LocalIdentity,
    config: EngineConfig,
    commands: mpsc::Receiver<Command>,
    connections: HashMap<ConnectionId, Connection>,
    pending_dials: HashSet<String>,
    listeners: ListenerRegistry,
    rpc: RpcTracker,
}

impl Engine {
    /// Start the engine task and hand back its client handle.
    pub fn spawn(
        ledger: Ledger,
        content: ContentStore,
        migrations: Arc<MigrationGate>,
        identity: LocalIdentity,
        config: EngineConfig,
    ) -> EngineHandle {
        let (commands, rx) = mpsc::channel(256);
        let engine = Engine {
            ledger,
            content,
            migrations,
            identity: identity.clone(),
            config,
            commands: rx,
            connections: HashMap::new(),
            pending_dials: HashSet::new(),
            listeners: ListenerRegistry::new(),
            rpc: RpcTracker::default(),
        };
        tokio::spawn(engine.run());
        EngineHandle {
            commands,
            identity,
            config,
        }
    }

    async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle(command).await,
                    }
                }
                _ = heartbeat.tick() => self.beat().await,
            }
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for conn in ids {
            self.close_connection(conn).await;
        }
        tracing::info!(node = %self.identity.node, "engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::PutItem {
                app,
                uri,
                payload,
                assets,
                reply,
            } => {
                let _ = reply.send(self.handle_put(app, uri, payload, assets).await);
            }
            Command::DeleteItems {
                app,
                host,
                path,
                prefix,
                reply,
            } => {
                let _ = reply.send(self.handle_delete(app, host, path, prefix).await);
            }
            Command::SendMessage {
                app,
                target,
                path,
                payload,
                reply,
            } => {
                let _ = reply.send(self.handle_send_message(app, target, path, payload).await);
            }
            Command::Subscribe { filter, reply } => {
                let _ = reply.send(self.listeners.subscribe(filter));
            }
            Command::Unsubscribe { id } => {
                self.listeners.unsubscribe(id);
            }
            Command::ConnectedNodes { reply } => {
                let _ = reply.send(self.connected_peers());
            }
            Command::ClaimDial { name, reply } => {
                let active = self
                    .connections
                    .values()
                    .any(|c| c.config_name.as_deref() == Some(name.as_str()));
                let granted = !active && self.pending_dials.insert(name);
                let _ = reply.send(granted);
            }
            Command::ReleaseDial { name } => {
                self.pending_dials.remove(&name);
            }
            Command::Register {
                conn,
                peer,
                writer,
                config_name,
            } => self.handle_register(conn, peer, writer, config_name).await,
            Command::Inbound { conn, message } => self.handle_inbound(conn, message).await,
            Command::ConnectionLost { conn } => self.close_connection(conn).await,
            Command::Shutdown => {}
        }
    }

    /// Heartbeat any link that has been idle a full interval.
    async fn beat(&mut self) {
        let idle: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.last_write.elapsed() >= self.config.heartbeat_interval)
            .map(|(id, _)| *id)
            .collect();
        for conn in idle {
            self.send_to(conn, &Message::Heartbeat).await;
        }
    }

    /// Write to one link. On failure the link is closed; a send to an
    /// unknown link is a no-op. Returns whether the write landed.
    async fn send_to(&mut self, conn: ConnectionId, message: &Message) -> bool {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return false;
        };
        match connection.writer.write_message(message).await {
            Ok(()) => {
                connection.last_write = Instant::now();
                true
            }
            Err(err) => {
                tracing::warn!(%conn, error = %err, "write failed, closing link");
                self.close_connection(conn).await;
                false
            }
        }
    }

    async fn close_connection(&mut self, conn: ConnectionId) {
        let Some(mut connection) = self.connections.remove(&conn) else {
            return;
        };
        let _ = connection.writer.shutdown().await;
        for (stream_id, staged) in connection.staged.drain() {
            tracing::debug!(%conn, stream_id = %stream_id, "discarding incomplete asset stream");
            if let Err(err) = staged.discard().await {
                tracing::warn!(error = %err, "cannot remove staged asset");
            }
        }
        tracing::info!(%conn, peer = %connection.peer.node, "link closed");
        self.emit(Event::PeerDisconnected {
            node: connection.peer.node,
        });
    }

    /// Deliver an event to listeners. Data-changed delivery is gated by
    /// any migration window open for the item's source node.
    fn emit(&mut self, event: Event) {
        if let Event::DataChanged { record } = &event {
            if !self
                .migrations
                .should_deliver_events(&record.app, &record.source)
            {
                tracing::debug!(
                    app = %record.app,
                    source = %record.source,
                    "event withheld during migration"
                );
                return;
            }
        }
        self.listeners.broadcast(&event);
    }

    fn peer_of(&self, conn: ConnectionId) -> Option<NodeId> {
        self.connections.get(&conn).map(|c| c.peer.node.clone())
    }

    fn connected_peers(&self) -> Vec<PeerIdentity> {
        let mut seen = HashSet::new();
        self.connections
            .values()
            .filter(|c| seen.insert(c.peer.node.clone()))
            .map(|c| c.peer.clone())
            .collect()
    }

    /// Our side of the watermark exchange: for every known source, the
    /// highest sequence we hold, plus zero rows for ourselves and the
    /// peer so both always appear.
    async fn sync_table_for(&self, peer: &NodeId) -> Result<Vec<SyncTableEntry>> {
        let mut table = vec![SyncTableEntry {
            key: NodeId::cloud(),
            value: CLOUD_WATERMARK,
        }];
        let mut seen_local = false;
        let mut seen_peer = false;

        for (node, seq) in self.ledger.source_watermarks().await? {
            if node.is_cloud() {
                continue;
            }
            seen_local = seen_local || node == self.identity.node;
            seen_peer = seen_peer || node == *peer;
            table.push(SyncTableEntry {
                key: node,
                value: seq,
            });
        }
        if !seen_local {
            table.push(SyncTableEntry {
                key: self.identity.node.clone(),
                value: 0,
            });
        }
        if !seen_peer {
            table.push(SyncTableEntry {
                key: peer.clone(),
                value: 0,
            });
        }
        Ok(table)
    }

    async fn handle_register(
        &mut self,
        conn: ConnectionId,
        peer: PeerIdentity,
        mut writer: PeerWriter,
        config_name: Option<String>,
    ) {
        if let Some(name) = &config_name {
            self.pending_dials.remove(name);
        }

        let table = match self.sync_table_for(&peer.node).await {
            Ok(table) => table,
            Err(err) => {
                tracing::warn!(%conn, error = %err, "cannot build sync table, dropping link");
                let _ = writer.shutdown().await;
                return;
            }
        };
        let sync_start = Message::SyncStart {
            received_seq_id: RECEIVED_SEQ_NONE,
            version: PROTOCOL_VERSION,
            sync_table: table,
        };
        if let Err(err) = writer.write_message(&sync_start).await {
            tracing::warn!(%conn, error = %err, "sync table write failed, dropping link");
            let _ = writer.shutdown().await;
            return;
        }

        self.connections.insert(
            conn,
            Connection {
                peer: peer.clone(),
                writer,
                config_name: config_name.clone(),
                last_write: Instant::now(),
                got_sync_start: false,
                staged: HashMap::new(),
            },
        );

        if let Some(name) = &config_name {
            if let Err(err) = self.ledger.record_connected(name, &peer.node).await {
                tracing::warn!(config = %name, error = %err, "cannot record handshake");
            }
        }

        // Re-request assets still missing; the previous holder may have
        // gone away before serving them.
        match self.ledger.missing_assets().await {
            Ok(missing) => {
                for (digest, app) in missing {
                    let fetch = Message::FetchAsset {
                        digest,
                        package: app.package,
                        signature: app.signature,
                        permission: String::new(),
                    };
                    if !self.send_to(conn, &fetch).await {
                        return;
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "missing-asset scan failed"),
        }

        self.emit(Event::PeerConnected { node: peer.node });
    }

    async fn handle_inbound(&mut self, conn: ConnectionId, message: Message) {
        if let Err(reason) = message.validate_limits() {
            tracing::warn!(%conn, kind = message.kind(), reason, "dropping invalid message");
            return;
        }

        match message {
            Message::Connect { id, .. } => {
                tracing::warn!(%conn, peer = %id, "unexpected Connect after handshake");
            }
            Message::Heartbeat => {}
            Message::SyncStart { sync_table, .. } => {
                self.handle_sync_start(conn, sync_table).await;
            }
            message @ Message::SetDataItem { .. } => {
                self.handle_set_data_item(conn, message).await;
            }
            Message::SetAsset {
                digest,
                data,
                has_asset,
                app_keys,
            } => {
                self.handle_set_asset(conn, digest, data, has_asset, app_keys)
                    .await;
            }
            Message::FetchAsset { digest, .. } => {
                self.handle_fetch_asset(conn, digest).await;
            }
            Message::AckAsset { digest } => {
                tracing::debug!(%conn, digest = %digest, "peer stored asset");
            }
            Message::FilePiece {
                stream_id,
                last_piece,
                bytes,
                digest,
            } => {
                self.handle_file_piece(conn, stream_id, last_piece, bytes, digest)
                    .await;
            }
            message @ Message::Request { .. } => {
                self.handle_request(conn, message).await;
            }
        }
    }

    /// The peer told us what it holds; push everything it lacks. Items
    /// only: the receiver fetches missing assets itself.
    async fn handle_sync_start(&mut self, conn: ConnectionId, sync_table: Vec<SyncTableEntry>) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        if connection.got_sync_start {
            tracing::warn!(%conn, "duplicate SyncStart, ignoring");
            return;
        }
        connection.got_sync_start = true;

        let mut named: HashSet<NodeId> = HashSet::new();
        let mut work: Vec<(NodeId, i64)> = Vec::new();
        for entry in sync_table {
            named.insert(entry.key.clone());
            if entry.key.is_cloud() {
                continue;
            }
            work.push((entry.key, entry.value));
        }
        // Sources the peer has never heard of start from zero.
        match self.ledger.source_watermarks().await {
            Ok(marks) => {
                for (node, _) in marks {
                    if !node.is_cloud() && !named.contains(&node) {
                        work.push((node, 0));
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "watermark scan failed"),
        }

        for (source, since) in work {
            let items = match self.ledger.modified_since(&source, since).await {
                Ok(items) => items,
                Err(err) => {
                    tracing::warn!(source = %source, error = %err, "backfill query failed");
                    continue;
                }
            };
            for item in items {
                if !self.send_to(conn, &Message::set_data_item(&item)).await {
                    return;
                }
            }
        }
    }

    async fn handle_set_data_item(&mut self, conn: ConnectionId, message: Message) {
        let Message::SetDataItem {
            package,
            signature,
            uri,
            seq,
            deleted,
            last_modified,
            source,
            payload,
            assets,
        } = message
        else {
            return;
        };
        let Some(peer) = self.peer_of(conn) else {
            return;
        };

        let parsed: ItemUri = match uri.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(%conn, uri = %uri, error = %err, "dropping item with bad uri");
                return;
            }
        };
        // An empty author field means the delivering peer authored it.
        let source = if source.is_empty() { peer } else { source };
        let record = DataItemRecord {
            app: AppKey::new(package, signature),
            uri: parsed,
            payload,
            assets: assets.into_iter().map(|a| (a.key, a.digest)).collect(),
            source,
            seq,
            deleted,
            last_modified,
            assets_ready: false,
        };

        let stored = match self.ledger.put_record(&record).await {
            Ok(ApplyResult::Applied(stored)) => stored,
            Ok(ApplyResult::Stale) => {
                tracing::debug!(%conn, uri = %record.uri, seq, "stale item delivery");
                return;
            }
            Err(err) => {
                tracing::warn!(%conn, error = %err, "cannot apply item");
                return;
            }
        };

        let needed: Vec<Digest> = stored.asset_digests().copied().collect();
        for digest in needed {
            match self.ledger.is_asset_present(&digest).await {
                Ok(true) => {}
                Ok(false) => {
                    let fetch = Message::FetchAsset {
                        digest,
                        package: stored.app.package.clone(),
                        signature: stored.app.signature.clone(),
                        permission: String::new(),
                    };
                    if !self.send_to(conn, &fetch).await {
                        return;
                    }
                }
                Err(err) => tracing::warn!(error = %err, "asset presence check failed"),
            }
        }

        // Items still waiting on assets surface later, when the last
        // asset lands.
        if stored.assets_ready {
            self.emit(Event::DataChanged { record: stored });
        }
    }

    async fn handle_set_asset(
        &mut self,
        conn: ConnectionId,
        digest: Digest,
        data: Option<Vec<u8>>,
        has_asset: bool,
        app_keys: Vec<AppKey>,
    ) {
        for app in &app_keys {
            if let Err(err) = self.ledger.grant_asset_access(app, &digest).await {
                tracing::warn!(error = %err, "cannot record asset grant");
            }
        }

        match data {
            Some(bytes) => match self.content.put(&digest, &bytes).await {
                Ok(()) => self.finish_asset(conn, digest).await,
                Err(err) => {
                    tracing::warn!(%conn, digest = %digest, error = %err, "inline asset rejected");
                }
            },
            None if !has_asset => {
                tracing::debug!(digest = %digest, "peer announced an asset it does not hold");
            }
            // Announce only; the bytes follow as FilePieces.
            None => {}
        }
    }

    async fn handle_fetch_asset(&mut self, conn: ConnectionId, digest: Digest) {
        if !self.content.contains(&digest).await {
            tracing::debug!(%conn, digest = %digest, "fetch for an asset we do not hold");
            return;
        }
        self.push_asset(conn, digest).await;
    }

    async fn handle_file_piece(
        &mut self,
        conn: ConnectionId,
        stream_id: String,
        last_piece: bool,
        bytes: Vec<u8>,
        digest: Option<Digest>,
    ) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };

        if !connection.staged.contains_key(&stream_id) {
            // Hash the wire id so it cannot address outside the staging
            // directory.
            let tag = Digest::of(stream_id.as_bytes()).to_hex();
            match self.content.begin(&tag).await {
                Ok(staged) => {
                    connection.staged.insert(stream_id.clone(), staged);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "cannot stage asset stream");
                    return;
                }
            }
        }

        let Some(staged) = connection.staged.get_mut(&stream_id) else {
            return;
        };
        if let Err(err) = staged.append(&bytes).await {
            tracing::warn!(error = %err, "asset append failed");
            if let Some(staged) = connection.staged.remove(&stream_id) {
                let _ = staged.discard().await;
            }
            return;
        }
        if !last_piece {
            return;
        }

        let Some(staged) = connection.staged.remove(&stream_id) else {
            return;
        };
        let Some(expected) = digest else {
            tracing::warn!(stream_id = %stream_id, "final piece carries no digest, discarding");
            let _ = staged.discard().await;
            return;
        };
        match self.content.commit(staged, &expected).await {
            Ok(()) => self.finish_asset(conn, expected).await,
            Err(err) => {
                tracing::warn!(%conn, digest = %expected, error = %err, "asset stream failed verification");
            }
        }
    }

    /// Mark `digest` present, ack it, and surface items that just became
    /// fully ready. The presence flip makes readiness events fire exactly
    /// once per digest.
    async fn finish_asset(&mut self, conn: ConnectionId, digest: Digest) {
        let flipped = match self.ledger.mark_asset_present(&digest).await {
            Ok(flipped) => flipped,
            Err(err) => {
                tracing::warn!(digest = %digest, error = %err, "cannot mark asset present");
                return;
            }
        };
        self.send_to(conn, &Message::AckAsset { digest }).await;
        if !flipped {
            return;
        }
        match self.ledger.newly_ready_items(&digest).await {
            Ok(items) => {
                for record in items {
                    self.emit(Event::DataChanged { record });
                }
            }
            Err(err) => tracing::warn!(error = %err, "ready-item scan failed"),
        }
    }

    /// Single-hop routing: deliver locally when the target is us or
    /// unspecified, drop everything else.
    async fn handle_request(&mut self, conn: ConnectionId, message: Message) {
        let Message::Request {
            target,
            source,
            path,
            payload,
            package,
            signature,
            request_id,
            generation,
        } = message
        else {
            return;
        };
        let Some(peer) = self.peer_of(conn) else {
            return;
        };

        if !target.is_empty() && target != self.identity.node {
            if target == peer {
                tracing::debug!(%conn, "dropping request addressed to its own sender");
            } else {
                tracing::warn!(%conn, target = %target, "no route to request target");
            }
            return;
        }

        let source = if source.is_empty() { peer } else { source };
        self.emit(Event::MessageReceived {
            app: AppKey::new(package, signature),
            source,
            path,
            payload,
            request_id: combined_request_id(generation, request_id),
        });
    }

    async fn handle_put(
        &mut self,
        app: AppKey,
        uri: ItemUri,
        payload: Option<Vec<u8>>,
        assets: BTreeMap<String, Digest>,
    ) -> Result<DataItemRecord> {
        let seq = self.ledger.next_seq().await?;
        let mut record = DataItemRecord::new(app, uri, payload);
        record.assets = assets;
        record.source = self.identity.node.clone();
        record.seq = seq;

        match self.ledger.put_record(&record).await? {
            ApplyResult::Applied(stored) => {
                if stored.assets_ready {
                    self.emit(Event::DataChanged {
                        record: stored.clone(),
                    });
                }
                self.push_record(&stored).await;
                Ok(stored)
            }
            ApplyResult::Stale => {
                // Only possible against a database restored with rows
                // newer than its counter.
                tracing::warn!(uri = %record.uri, seq, "local write lost to an existing row");
                Ok(record)
            }
        }
    }

    async fn handle_delete(
        &mut self,
        app: AppKey,
        host: Option<NodeId>,
        path: String,
        prefix: bool,
    ) -> Result<usize> {
        let local = self.identity.node.clone();
        let tombstones = self
            .ledger
            .delete_items(&app, host.as_ref(), &path, prefix, &local)
            .await?;
        for tombstone in &tombstones {
            self.emit(Event::DataChanged {
                record: tombstone.clone(),
            });
            self.push_record(tombstone).await;
        }
        Ok(tombstones.len())
    }

    async fn handle_send_message(
        &mut self,
        app: AppKey,
        target: NodeId,
        path: String,
        payload: Vec<u8>,
    ) -> Result<i64> {
        let conn = self
            .connections
            .iter()
            .find(|(_, c)| c.peer.node == target)
            .map(|(id, _)| *id)
            .ok_or_else(|| SyncError::PeerNotConnected(target.to_string()))?;

        let (generation, request_id) = self.rpc.next(&app, &target, &path);
        let message = Message::Request {
            target: target.clone(),
            source: self.identity.node.clone(),
            path,
            payload,
            package: app.package,
            signature: app.signature,
            request_id,
            generation,
        };
        if self.send_to(conn, &message).await {
            Ok(combined_request_id(generation, request_id))
        } else {
            Err(SyncError::PeerNotConnected(target.to_string()))
        }
    }

    /// Push one applied record to every live link, streaming referenced
    /// assets ahead of the item.
    async fn push_record(&mut self, record: &DataItemRecord) {
        if self.connections.is_empty() {
            return;
        }
        let conns: Vec<ConnectionId> = self.connections.keys().copied().collect();
        let assets: Vec<Digest> = if record.deleted {
            Vec::new()
        } else {
            record.asset_digests().copied().collect()
        };
        let message = Message::set_data_item(record);

        for conn in conns {
            for digest in &assets {
                if !self.push_asset(conn, *digest).await {
                    break;
                }
            }
            self.send_to(conn, &message).await;
        }
    }

    /// Announce one asset and stream its bytes. Returns false only when
    /// the link died mid-push.
    async fn push_asset(&mut self, conn: ConnectionId, digest: Digest) -> bool {
        let app_keys = match self.ledger.asset_acl_apps(&digest).await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(error = %err, "acl lookup failed");
                Vec::new()
            }
        };
        let announce = Message::SetAsset {
            digest,
            data: None,
            has_asset: true,
            app_keys,
        };
        let stream_id = match announce.encode() {
            Ok(bytes) => Digest::of(&bytes).to_hex(),
            Err(err) => {
                tracing::warn!(error = %err, "cannot encode asset announcement");
                return true;
            }
        };
        let mut reader = match self.content.open_reader(&digest).await {
            Ok(reader) => reader,
            Err(err) => {
                tracing::debug!(digest = %digest, error = %err, "asset not on disk, skipping push");
                return true;
            }
        };
        if !self.send_to(conn, &announce).await {
            return false;
        }

        // One chunk of lookahead so the final piece is known when read()
        // returns empty and can carry the content digest.
        let mut pending: Option<Vec<u8>> = None;
        loop {
            let mut buf = vec![0u8; limits::ASSET_CHUNK_SIZE];
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(digest = %digest, error = %err, "asset read failed mid-stream");
                    return true;
                }
            };
            if n == 0 {
                break;
            }
            buf.truncate(n);
            if let Some(bytes) = pending.replace(buf) {
                let piece = Message::FilePiece {
                    stream_id: stream_id.clone(),
                    last_piece: false,
                    bytes,
                    digest: None,
                };
                if !self.send_to(conn, &piece).await {
                    return false;
                }
            }
        }

        let piece = Message::FilePiece {
            stream_id,
            last_piece: true,
            bytes: pending.unwrap_or_default(),
            digest: Some(digest),
        };
        self.send_to(conn, &piece).await
    }
}
