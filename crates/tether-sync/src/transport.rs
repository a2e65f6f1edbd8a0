//! Transport abstraction for peer links.
//!
//! A transport hands out raw byte streams; framing and message codecs sit
//! on top. Implementations may use TCP, Bluetooth sockets, or any other
//! ordered byte pipe.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Result, SyncError};

/// Default TCP port for node-to-node links.
pub const DEFAULT_PORT: u16 = 5601;

/// An ordered, bidirectional byte stream to one peer.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Sync + Unpin + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin + std::fmt::Debug> Duplex for T {}

/// Opens and accepts peer links.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open an outbound link to the given address.
    async fn dial(&self, address: &str) -> Result<Box<dyn Duplex>>;

    /// Wait for the next inbound link.
    async fn accept(&self) -> Result<Box<dyn Duplex>>;
}

/// TCP transport.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a listener on the given address, e.g. `"0.0.0.0:5601"`.
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, address: &str) -> Result<Box<dyn Duplex>> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn accept(&self) -> Result<Box<dyn Duplex>> {
        let (stream, _) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// A simple in-memory transport for testing.
///
/// Addresses are plain strings; dialing one hands the far end of a paired
/// duplex stream to that address's acceptor.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::io::DuplexStream;
    use tokio::sync::{mpsc, Mutex, RwLock};

    use super::*;

    const PIPE_CAPACITY: usize = 256 * 1024;

    /// Shared state for the memory transport network.
    pub struct MemoryNetwork {
        /// Inbound-link channels for each registered address.
        acceptors: RwLock<HashMap<String, mpsc::Sender<DuplexStream>>>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a transport listening on `address` within this network.
        pub async fn create_transport(self: &Arc<Self>, address: &str) -> MemoryTransport {
            let (tx, rx) = mpsc::channel(16);
            self.acceptors.write().await.insert(address.to_string(), tx);
            MemoryTransport {
                network: Arc::clone(self),
                inbound: Mutex::new(rx),
            }
        }
    }

    impl Default for MemoryNetwork {
        fn default() -> Self {
            Self {
                acceptors: RwLock::new(HashMap::new()),
            }
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        network: Arc<MemoryNetwork>,
        inbound: Mutex<mpsc::Receiver<DuplexStream>>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn dial(&self, address: &str) -> Result<Box<dyn Duplex>> {
            let acceptors = self.network.acceptors.read().await;
            let Some(acceptor) = acceptors.get(address) else {
                return Err(SyncError::TransportFailure(format!(
                    "no such address: {address}"
                )));
            };
            let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
            acceptor
                .send(far)
                .await
                .map_err(|_| SyncError::TransportFailure("acceptor gone".into()))?;
            Ok(Box::new(near))
        }

        async fn accept(&self) -> Result<Box<dyn Duplex>> {
            let mut inbound = self.inbound.lock().await;
            match inbound.recv().await {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(SyncError::TransportFailure("network closed".into())),
            }
        }
    }
}
