//! Dispatch gRPC server bootstrap.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use crate::config;
use crate::messages::proto::dispatch_server::DispatchServer;
use crate::registry::ServiceRegistry;
use crate::store::ResultStore;

use super::{DispatchGrpcService, DispatchService};

/// A running dispatch server. Dropping the handle does not stop the
/// server; call [`shutdown`](Self::shutdown).
pub struct DispatchServerHandle {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl DispatchServerHandle {
    /// Bind and serve the dispatch API. With `bind` unset the address comes
    /// from configuration, so tests can pass an ephemeral `127.0.0.1:0`.
    pub async fn start(
        bind: Option<SocketAddr>,
        store: Arc<dyn ResultStore>,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Result<Self> {
        let bind = match bind {
            Some(addr) => addr,
            None => config::try_get_config()?.dispatch_grpc_addr,
        };
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind dispatch server on {bind}"))?;
        let addr = listener.local_addr()?;

        let dispatch = DispatchService::new(store, registry);
        let grpc = DispatchGrpcService::new(dispatch);

        let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<DispatchServer<DispatchGrpcService>>()
            .await;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            Server::builder()
                .add_service(health_service)
                .add_service(DispatchServer::new(grpc))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(addr = %addr, "dispatch server listening");
        Ok(Self {
            addr,
            shutdown_tx,
            server,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.server.await?.context("dispatch server failed")
    }
}
