//! Session establishment and the per-link read loop.
//!
//! Both sides of a fresh link send [`Message::Connect`] and wait for the
//! peer's, bounded by the handshake timeout. Once identities are exchanged
//! the session registers its write half with the engine and turns into a
//! plain read loop that forwards every inbound message; the engine never
//! touches sockets directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc;

use tether_core::NodeId;

use crate::engine::{Command, EngineConfig};
use crate::error::{Result, SyncError};
use crate::framing::{FrameReader, FrameWriter};
use crate::messages::{Message, PROTOCOL_VERSION};
use crate::transport::Duplex;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Identifies one live link for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the peer told us about itself during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerIdentity {
    pub node: NodeId,
    pub display_name: String,
    pub network_id: String,
    pub device_id: String,
    pub version: i32,
}

pub(crate) type PeerWriter = FrameWriter<WriteHalf<Box<dyn Duplex>>>;

/// Exchange `Connect` messages with the peer.
///
/// Our own `hello` goes out first; anything other than a `Connect` reply
/// is a protocol violation. Version differences are tolerated: the wire
/// format is the contract, the version number is advisory.
pub(crate) async fn handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    hello: &Message,
    timeout: Duration,
) -> Result<PeerIdentity>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_message(hello).await?;

    let reply = tokio::time::timeout(timeout, reader.read_message())
        .await
        .map_err(|_| SyncError::Timeout("waiting for peer handshake".into()))??;

    match reply {
        Message::Connect {
            id,
            name,
            network_id,
            device_id,
            version,
        } => {
            if id.is_empty() {
                return Err(SyncError::ProtocolViolation(
                    "peer sent an empty node id".into(),
                ));
            }
            if let Message::Connect { id: local, .. } = hello {
                if *local == id {
                    return Err(SyncError::ProtocolViolation(
                        "peer claims our own node id".into(),
                    ));
                }
            }
            if version != PROTOCOL_VERSION {
                tracing::info!(peer = %id, version, "peer speaks a different protocol version");
            }
            Ok(PeerIdentity {
                node: id,
                display_name: name,
                network_id,
                device_id,
                version,
            })
        }
        other => Err(SyncError::ProtocolViolation(format!(
            "expected Connect during handshake, got {}",
            other.kind()
        ))),
    }
}

/// Run a full session over `stream`: handshake, register with the engine,
/// then pump inbound messages until the link dies.
///
/// Returns `Err` only when the session never registered (handshake failed
/// or the engine is gone). After registration the engine learns about the
/// link's end through `ConnectionLost` and this returns `Ok`.
pub(crate) async fn establish(
    stream: Box<dyn Duplex>,
    hello: Message,
    config: EngineConfig,
    commands: mpsc::Sender<Command>,
    config_name: Option<String>,
) -> Result<()> {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half).with_timeout(config.read_timeout);
    let mut writer = FrameWriter::new(write_half);

    let peer = handshake(&mut reader, &mut writer, &hello, config.handshake_timeout).await?;
    let conn = ConnectionId::next();
    tracing::info!(%conn, peer = %peer.node, name = %peer.display_name, "session established");

    // Register travels on the same queue as inbound messages, so the
    // engine always sees it before anything this reader forwards.
    commands
        .send(Command::Register {
            conn,
            peer: peer.clone(),
            writer,
            config_name,
        })
        .await
        .map_err(|_| SyncError::EngineStopped)?;

    run_reader(conn, &peer.node, &mut reader, &commands).await;
    let _ = commands.send(Command::ConnectionLost { conn }).await;
    Ok(())
}

/// Forward inbound messages until the link fails or the watchdog fires.
/// Malformed messages are logged and skipped; framing and transport
/// errors end the session.
async fn run_reader<R: AsyncRead + Unpin>(
    conn: ConnectionId,
    peer: &NodeId,
    reader: &mut FrameReader<R>,
    commands: &mpsc::Sender<Command>,
) {
    loop {
        match reader.read_message().await {
            Ok(message) => {
                if commands
                    .send(Command::Inbound { conn, message })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(SyncError::ProtocolViolation(reason)) => {
                tracing::warn!(%conn, %peer, reason = %reason, "ignoring malformed message");
            }
            Err(SyncError::Timeout(_)) => {
                tracing::info!(%conn, %peer, "read watchdog expired, closing session");
                return;
            }
            Err(err) => {
                tracing::info!(%conn, %peer, error = %err, "session read ended");
                return;
            }
        }
    }
}
