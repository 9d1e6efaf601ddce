use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use crate::config::TunnelConfig;
use crate::packet::packet::{Packet, PacketKind};
use crate::pool::buffer_pool::PooledBuf;
use crate::pool::SessionPools;
use crate::session::request::Request;
use crate::session::response::Response;
use crate::session::router::Router;
use crate::session::util::wait_action;
use crate::tunnel::backend::BackendSession;
use crate::tunnel::conn::{is_closed, is_malformed, is_timeout, TunnelConn, TunnelStream};

/// The backend side of the tunnel: serves connections from agents, dispatching every routed
///  request to the router on a task of its own and writing the result back through the tunnel.
pub struct AgentService {
    router: Arc<dyn Router>,
    config: TunnelConfig,
    pools: Arc<SessionPools>,
    session_counter: AtomicU32,
    shutdown: watch::Sender<bool>,
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|s| *s).await;
}

impl AgentService {
    pub fn new(router: Arc<dyn Router>, config: TunnelConfig, pools: Arc<SessionPools>) -> anyhow::Result<Arc<AgentService>> {
        config.validate()?;
        Ok(Arc::new(AgentService {
            router,
            config,
            pools,
            session_counter: AtomicU32::new(0),
            shutdown: watch::Sender::new(false),
        }))
    }

    /// Accepts agent connections, serving each on a task of its own, until [AgentService::shutdown]
    ///  is called
    pub async fn accept_loop(self: &Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let (stream, addr) = select! {
                r = listener.accept() => r?,
                _ = shutdown_requested(&mut shutdown) => {
                    info!("shutting down: no longer accepting agent connections");
                    return Ok(());
                }
            };
            stream.set_nodelay(true)?;

            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.serve(stream, addr.to_string()).await {
                    warn!("connection from {} broke with an error: {}", addr, e);
                }
            });
        }
    }

    /// Stops reading on all served connections. In-flight requests are given the drain grace
    ///  period to complete before the connections are closed.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Serves one agent connection until its read loop ends: on a read timeout, a broken
    ///  connection or a shutdown. Returns after in-flight requests completed (or the grace period
    ///  expired) and the session was closed.
    #[instrument(name="agent_connection", skip_all, fields(peer = %peer))]
    pub async fn serve(self: &Arc<Self>, stream: impl TunnelStream, peer: String) -> anyhow::Result<()> {
        let conn = TunnelConn::new(stream, peer, &self.config, self.pools.clone())?;
        let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let session = BackendSession::new(session_id, conn, &self.config);
        debug!(session_id, "serving agent connection");

        session.start_ping_watchdog();

        let mut shutdown = self.shutdown.subscribe();
        let mut dispatches = JoinSet::new();
        loop {
            let read_result = select! {
                r = session.read_request() => r,
                _ = shutdown_requested(&mut shutdown) => {
                    info!("shutting down: no more reads");
                    break;
                }
            };

            match read_result {
                Ok(packet) => self.on_packet(&session, packet, &mut dispatches),
                Err(e) if is_malformed(&e) => {
                    debug!("dropping malformed packet: {}", e);
                }
                Err(e) if is_timeout(&e) => {
                    info!("read timed out, ending session");
                    break;
                }
                Err(e) if is_closed(&e) => {
                    debug!("connection closed");
                    break;
                }
                Err(e) => {
                    warn!("read failed, ending session: {}", e);
                    break;
                }
            }

            while let Some(finished) = dispatches.try_join_next() {
                log_dispatch_outcome(finished);
            }
        }

        let grace_period = self.config.drain_grace_period;
        if !wait_action(session.wait_requests_done(), grace_period).await {
            warn!("{} requests still in flight after {:?}, closing anyway", session.num_requests_in_flight(), grace_period);
        }
        while let Some(finished) = dispatches.try_join_next() {
            log_dispatch_outcome(finished);
        }
        // requests are never cancelled: stragglers keep running, but their writes will fail
        dispatches.detach_all();

        session.close().await;
        Ok(())
    }

    fn on_packet(&self, session: &Arc<BackendSession>, packet: Packet<PooledBuf>, dispatches: &mut JoinSet<()>) {
        if let PacketKind::Command(_) = packet.kind() {
            session.handle_control(&packet);
            return;
        }

        let request = match Request::from_agent(packet) {
            Ok(request) => request,
            Err(e) => {
                debug!("dropping packet: {}", e);
                return;
            }
        };

        let guard = session.add_request();
        let router = self.router.clone();
        let session = session.clone();
        let dispatch_timeout = self.config.dispatch_timeout;
        dispatches.spawn(async move {
            let _guard = guard;
            dispatch(router.as_ref(), &session, request, dispatch_timeout).await;
        }.in_current_span());
    }
}

fn log_dispatch_outcome(outcome: Result<(), JoinError>) {
    match outcome {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!("dispatch task panicked: {}", e),
        Err(e) => warn!("dispatch task failed: {}", e),
    }
}

#[instrument(skip_all, fields(conn_id = request.conn_id(), mid = request.mid(), aid = request.aid()))]
async fn dispatch(router: &dyn Router, session: &BackendSession, request: Request, dispatch_timeout: Duration) {
    trace!("dispatching {:?}", request);

    let dispatched = match timeout(dispatch_timeout, router.dispatch(&request)).await {
        Ok(dispatched) => dispatched,
        Err(_) => {
            warn!("router did not return within {:?}, dropping request", dispatch_timeout);
            return;
        }
    };
    if dispatched.timed_out {
        warn!("router timed out");
    }
    let Some(result) = dispatched.result
    else {
        debug!("no result to send back");
        return;
    };

    let conn_id = request.conn_id();
    let packet = match Response::for_request(&request, result.as_ref()).encode(conn_id, None) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("failed to encode response: {}", e);
            return;
        }
    };
    // the request's buffer goes back to the pool before the write
    drop(request);

    if let Err(e) = session.write(packet.as_bytes()).await {
        warn!("failed to write response: {}", e);
    }
}
