//! The agent side of the tunnel: terminates client connections and multiplexes them over a
//!  tunnel to a backend service.

pub mod connector;
pub mod forwarder;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::TunnelConfig;
use crate::gateway::connector::BackendConnector;
use crate::gateway::forwarder::Forwarder;
use crate::pool::SessionPools;
use crate::tunnel::backend::BackendSession;
use crate::tunnel::conn::{TunnelConn, TunnelStream};
use crate::tunnel::frontend::FrontendSession;

pub struct Gateway {
    connector: BackendConnector,
    forwarder: Arc<Forwarder>,
    config: TunnelConfig,
    pools: Arc<SessionPools>,
    backend: Mutex<Option<Arc<BackendSession>>>,
}

impl Gateway {
    pub fn new(backend_addr: impl Into<String>, agent_id: u32, config: TunnelConfig, pools: Arc<SessionPools>) -> anyhow::Result<Arc<Gateway>> {
        config.validate()?;
        let crypto = Arc::new(config.crypto()?);
        Ok(Arc::new(Gateway {
            connector: BackendConnector::new(backend_addr, agent_id, config.clone(), pools.clone()),
            forwarder: Arc::new(Forwarder::new(crypto, config.response_timeout)),
            config,
            pools,
            backend: Mutex::new(None),
        }))
    }

    /// The current tunnel. If there is none or it was closed, a new one is established, subject
    ///  to the reconnect backoff.
    pub async fn backend(&self) -> anyhow::Result<Arc<BackendSession>> {
        let mut current = self.backend.lock().await;
        if let Some(backend) = current.as_ref() {
            if !backend.is_closed() {
                return Ok(backend.clone());
            }
        }

        let backend = self.connector.connect().await?;
        tokio::spawn({
            let forwarder = self.forwarder.clone();
            let backend = backend.clone();
            async move { forwarder.relay_responses(backend).await }
        });
        *current = Some(backend.clone());
        Ok(backend)
    }

    pub async fn accept_clients(self: &Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("accepting clients on {:?}", listener.local_addr());
        loop {
            let (stream, addr) = listener.accept().await?;
            stream.set_nodelay(true)?;

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.serve_client(stream, addr.to_string()).await {
                    warn!("client connection from {} broke with an error: {}", addr, e);
                }
            });
        }
    }

    pub async fn serve_client(&self, stream: impl TunnelStream, peer: String) -> anyhow::Result<()> {
        let frontend = FrontendSession::new(TunnelConn::new(stream, peer, &self.config, self.pools.clone())?);
        let backend = match self.backend().await {
            Ok(backend) => backend,
            Err(e) => {
                frontend.close().await;
                return Err(e);
            }
        };
        self.forwarder.serve_client(frontend, &backend).await
    }
}
