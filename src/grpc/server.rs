//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::keygate_server::KeygateServer;
use super::service::KeygateService;
use crate::edge::EdgeCoordinator;
use crate::error::{KeygateError, Result};

/// gRPC server for the Keygate service.
pub struct GrpcServer {
    listener: TcpListener,
    coordinator: Arc<EdgeCoordinator>,
}

impl GrpcServer {
    /// Bind the listening socket. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr, coordinator: Arc<EdgeCoordinator>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            coordinator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let addr = self.local_addr()?;
        let service = KeygateService::new(self.coordinator);

        info!(addr = %addr, "Starting gRPC server for Keygate");

        Server::builder()
            .add_service(KeygateServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                KeygateError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::EdgeConfig;
    use crate::edge::Stores;
    use crate::keys::MemoryKeyStore;
    use crate::ratelimit::MemoryOverrideStore;
    use crate::store::{MemoryLedgerStore, MemoryWindowStore};

    fn coordinator() -> Arc<EdgeCoordinator> {
        let stores = Stores {
            keys: Arc::new(MemoryKeyStore::new()),
            overrides: Arc::new(MemoryOverrideStore::new()),
            windows: Arc::new(MemoryWindowStore::new()),
            ledger: Arc::new(MemoryLedgerStore::new()),
        };
        Arc::new(EdgeCoordinator::new(stores, &EdgeConfig::default(), Arc::new(SystemClock)))
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port_and_shutdown() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = GrpcServer::bind(addr, coordinator()).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_with_shutdown(async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
