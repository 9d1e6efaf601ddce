use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use crate::config::TunnelConfig;
use crate::pool::SessionPools;
use crate::tunnel::backend::BackendSession;
use crate::tunnel::backoff::ReconnectBackoff;
use crate::tunnel::conn::{ConnError, TunnelConn, TunnelStream};

/// Establishes tunnel connections from an agent to a backend service. Connection attempts are
///  gated by a [ReconnectBackoff]; an established tunnel announces the agent's id and keeps itself
///  alive with pings.
pub struct BackendConnector {
    addr: String,
    agent_id: u32,
    config: TunnelConfig,
    pools: Arc<SessionPools>,
    backoff: Mutex<ReconnectBackoff>,
    session_counter: AtomicU32,
}

impl BackendConnector {
    pub fn new(addr: impl Into<String>, agent_id: u32, config: TunnelConfig, pools: Arc<SessionPools>) -> BackendConnector {
        BackendConnector {
            addr: addr.into(),
            agent_id,
            config,
            pools,
            backoff: Default::default(),
            session_counter: AtomicU32::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Fails without a connection attempt if the previous attempt was too recent
    #[instrument(skip_all, fields(addr = %self.addr))]
    pub async fn connect(&self) -> anyhow::Result<Arc<BackendSession>> {
        if !self.backoff.lock().unwrap_or_else(|e| e.into_inner()).try_again() {
            bail!("backing off: not reconnecting to {} yet", self.addr);
        }

        debug!("connecting");
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnError::Timeout.into()),
        };
        stream.set_nodelay(true)?;

        let session = self.establish(stream, self.addr.clone()).await?;
        self.backoff.lock().unwrap_or_else(|e| e.into_inner()).reset();
        info!(backend = session.id(), "connected to backend service");
        Ok(session)
    }

    /// Sets up a tunnel over an established stream: registers with the peer and starts sending
    ///  pings
    pub async fn establish(&self, stream: impl TunnelStream, peer: String) -> anyhow::Result<Arc<BackendSession>> {
        let conn = TunnelConn::new(stream, peer, &self.config, self.pools.clone())?;
        let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let session = BackendSession::new(session_id, conn, &self.config);

        if let Err(e) = session.register(self.agent_id).await {
            session.close().await;
            return Err(e);
        }
        session.start_ping();
        Ok(session)
    }
}
