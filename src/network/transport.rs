use crate::network::protocol::{read_message, write_message, Message, ProtocolHandler};
use crate::{CoinError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// One request, one response. Implementations bound every call in time.
pub trait PeerTransport: Clone + Send + Sync + 'static {
    fn request(&self, addr: &str, message: Message) -> impl Future<Output = Result<Message>> + Send;
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

impl PeerTransport for TcpTransport {
    fn request(&self, addr: &str, message: Message) -> impl Future<Output = Result<Message>> + Send {
        let addr = addr.to_string();
        let connect_timeout = self.connect_timeout;
        let request_timeout = self.request_timeout;

        async move {
            let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| CoinError::PeerUnreachable(format!("{}: connect timeout", addr)))?
                .map_err(|e| CoinError::PeerUnreachable(format!("{}: {}", addr, e)))?;
            stream.set_nodelay(true)?;

            tokio::time::timeout(request_timeout, async {
                write_message(&mut stream, &message).await?;
                read_message(&mut stream).await
            })
            .await
            .map_err(|_| CoinError::Network(format!("{}: request timeout", addr)))?
        }
    }
}

/// Accepts peer connections until `shutdown` flips. A connection may carry
/// any number of requests in sequence.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<ProtocolHandler>,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    log::info!("🌐 Listening for peers on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &addr.to_string(), handler, idle_timeout).await {
                        log::debug!("Connection with {} closed: {}", addr, e);
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log::info!("🛑 Peer listener stopped");
    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: &str,
    handler: Arc<ProtocolHandler>,
    idle_timeout: Duration,
) -> Result<()> {
    loop {
        let request = match tokio::time::timeout(idle_timeout, read_message(&mut stream)).await {
            Ok(Ok(request)) => request,
            Ok(Err(CoinError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()),
        };

        let handler = handler.clone();
        let peer_name = peer.to_string();
        let response = tokio::task::spawn_blocking(move || handler.handle_message(request, &peer_name))
            .await
            .map_err(|e| CoinError::Network(format!("Request handler failed: {}", e)))?;
        write_message(&mut stream, &response).await?;
    }
}

/// In-process transport that delivers requests straight to registered
/// handlers. Used for local multi-node setups and tests.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    handlers: Arc<RwLock<HashMap<String, Arc<ProtocolHandler>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: impl Into<String>, handler: Arc<ProtocolHandler>) {
        self.handlers.write().insert(addr.into(), handler);
    }

    /// Makes `addr` unreachable.
    pub fn disconnect(&self, addr: &str) {
        self.handlers.write().remove(addr);
    }
}

impl PeerTransport for MemoryTransport {
    fn request(&self, addr: &str, message: Message) -> impl Future<Output = Result<Message>> + Send {
        let handler = self.handlers.read().get(addr).cloned();
        let addr = addr.to_string();

        async move {
            let handler = handler.ok_or_else(|| CoinError::PeerUnreachable(addr.clone()))?;
            tokio::task::spawn_blocking(move || handler.handle_message(message, "memory"))
                .await
                .map_err(|e| CoinError::Network(format!("{}: handler failed: {}", addr, e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::ConsensusParams;
    use crate::core::{Blockchain, Mempool};
    use crate::network::sync::{PeerTable, SyncConfig};
    use crate::node::NodeHandle;
    use crate::storage::Database;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    fn handler(dir: &TempDir) -> Result<(Arc<ProtocolHandler>, NodeHandle)> {
        let chain = Blockchain::open(Database::open(dir.path())?, ConsensusParams::regtest(), false)?;
        let (node, _) = NodeHandle::new(chain, Mempool::default());
        let peers = Arc::new(Mutex::new(PeerTable::new(&SyncConfig::default(), None)));
        let handler = ProtocolHandler::new(node.clone(), peers, Arc::new(Notify::new()), None);
        Ok((Arc::new(handler), node))
    }

    #[tokio::test]
    async fn test_tcp_request_response() -> Result<()> {
        let dir = TempDir::new()?;
        let (handler, node) = handler(&dir)?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, handler, Duration::from_secs(5), shutdown_rx));

        let transport = TcpTransport::new(Duration::from_secs(5), Duration::from_secs(5));
        let response = transport
            .request(&addr, Message::GetHeaders { from_height: 0, count: 10 })
            .await?;
        match response {
            Message::Headers(headers) => {
                assert_eq!(headers.len(), 1);
                assert_eq!(headers[0].height, 0);
                assert_eq!(
                    crate::crypto::hash::Hashable::hash(&headers[0]),
                    node.tip().hash
                );
            }
            other => panic!("unexpected response {:?}", other),
        }

        shutdown_tx.send_replace(true);
        server.await.map_err(|e| CoinError::Network(e.to_string()))??;
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_peer() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        drop(listener);

        let transport = TcpTransport::new(Duration::from_secs(2), Duration::from_secs(2));
        let err = transport.request(&addr, Message::GetPeers).await.unwrap_err();
        assert!(matches!(err, CoinError::PeerUnreachable(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_transport_routes_by_address() -> Result<()> {
        let dir = TempDir::new()?;
        let (handler, _) = handler(&dir)?;
        let transport = MemoryTransport::new();
        transport.register("node-a", handler);

        assert_eq!(transport.request("node-a", Message::GetPeers).await?, Message::Peers(vec![]));

        transport.disconnect("node-a");
        assert!(matches!(
            transport.request("node-a", Message::GetPeers).await,
            Err(CoinError::PeerUnreachable(_))
        ));
        Ok(())
    }
}
