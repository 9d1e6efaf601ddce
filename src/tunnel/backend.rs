use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn, Instrument};

use crate::config::TunnelConfig;
use crate::packet::packet::{Command, Packet};
use crate::pool::buffer_pool::PooledBuf;
use crate::tunnel::conn::{ConnError, TunnelConn};
use crate::tunnel::frontend::FrontendSession;
use crate::tunnel::state::{AtomicSessionState, SessionState};

/// ids up to and including this are never handed out to frontend sessions; 0 is the connection
///  id of control packets
const FRONTEND_ID_BASE: u32 = 100;

/// Counts requests that were dispatched but have not completed yet
#[derive(Default)]
pub struct InFlightRequests {
    count: AtomicUsize,
    all_done: Notify,
}

impl InFlightRequests {
    pub fn num_in_flight(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// returns once there are no requests in flight
    pub async fn wait_done(&self) {
        loop {
            let notified = self.all_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.num_in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Marks a request as in flight for as long as it lives - including while a panic unwinds the
///  task that owns it
pub struct RequestGuard {
    in_flight: Arc<InFlightRequests>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.all_done.notify_waiters();
        }
    }
}

/// One multiplexed tunnel connection, shared by any number of frontend sessions that are told
///  apart by connection id.
///
/// The session is created `Open` and closed exactly once, either explicitly, by the keepalive
///  timers, or by the read loop ending. Closing closes every bound frontend session and the
///  underlying connection.
pub struct BackendSession {
    id: u32,
    conn: TunnelConn,
    state: AtomicSessionState,

    min_ping_interval: Duration,
    ping_send_interval: Duration,
    last_ping: Mutex<Instant>,
    /// the session id the peer announced by a register command
    peer_id: Mutex<Option<u32>>,

    frontends: RwLock<FxHashMap<u32, Arc<FrontendSession>>>,
    id_counter: AtomicU32,

    in_flight: Arc<InFlightRequests>,
}

impl Debug for BackendSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BackendSession{{id:{}, peer:{}, state:{:?}}}", self.id, self.peer(), self.state())
    }
}

impl BackendSession {
    pub fn new(id: u32, conn: TunnelConn, config: &TunnelConfig) -> Arc<BackendSession> {
        Arc::new(BackendSession {
            id,
            conn,
            state: AtomicSessionState::new(),
            min_ping_interval: config.min_ping_interval,
            ping_send_interval: config.ping_send_interval(),
            last_ping: Mutex::new(Instant::now()),
            peer_id: Mutex::new(None),
            frontends: Default::default(),
            id_counter: AtomicU32::new(0),
            in_flight: Default::default(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> &str {
        self.conn.peer()
    }

    pub fn peer_id(&self) -> Option<u32> {
        *self.peer_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        !self.state.is_open()
    }

    pub fn conn(&self) -> &TunnelConn {
        &self.conn
    }

    /// announces this tunnel's session id to the peer
    pub async fn register(&self, sid: u32) -> anyhow::Result<()> {
        debug!(session_id = sid, "registering with peer");
        self.write(Packet::register(sid).as_bytes()).await
    }

    pub async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        if !self.state.is_open() {
            return Err(ConnError::Closed.into());
        }
        self.conn.write_packet(data).await
    }

    /// Reads the next packet from the tunnel, waiting at most for the read timeout
    pub async fn read_request(&self) -> anyhow::Result<Packet<PooledBuf>> {
        self.conn.read_packet().await
    }

    pub fn update_ping(&self) {
        *self.last_ping.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn last_ping(&self) -> Instant {
        *self.last_ping.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handles a control packet. Unknown command codes are logged and dropped.
    pub fn handle_control<B: AsRef<[u8]>>(&self, packet: &Packet<B>) {
        match Command::try_from(packet.cmd()) {
            Ok(Command::Ping) => {
                trace!(backend = self.id, "received ping");
                self.update_ping();
            }
            Ok(Command::Register) => {
                let sid = packet.conn_id();
                info!(backend = self.id, peer = self.peer(), session_id = sid, "peer registered");
                *self.peer_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(sid);
            }
            Err(_) => {
                warn!(backend = self.id, peer = self.peer(), "received unknown command {:#06x} - dropping packet", packet.cmd());
            }
        }
    }

    /// Marks a request as in flight until the returned guard is dropped
    pub fn add_request(&self) -> RequestGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        RequestGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn num_requests_in_flight(&self) -> usize {
        self.in_flight.num_in_flight()
    }

    /// returns once all dispatched requests have completed; callers bound the wait
    pub async fn wait_requests_done(&self) {
        self.in_flight.wait_done().await
    }

    /// Starts sending a ping every `min_ping_interval - 2s`. A failed write closes the session.
    pub fn start_ping(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::downgrade(self);
        let period = self.ping_send_interval;
        let span = tracing::info_span!("ping_sender", backend = self.id);

        self.spawn_periodic(period, span, move || {
            let session = session.clone();
            async move {
                let Some(session) = session.upgrade()
                else {
                    return false;
                };
                match session.write(Packet::ping().as_bytes()).await {
                    Ok(()) => {
                        trace!("sent ping");
                        true
                    }
                    Err(e) => {
                        warn!("failed to send ping, closing session: {}", e);
                        session.close().await;
                        false
                    }
                }
            }
        })
    }

    /// Starts checking every `min_ping_interval` that a ping was received within the last
    ///  `min_ping_interval`, closing the session otherwise.
    pub fn start_ping_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::downgrade(self);
        let period = self.min_ping_interval;
        let span = tracing::info_span!("ping_watchdog", backend = self.id);

        self.spawn_periodic(period, span, move || {
            let session = session.clone();
            async move {
                let Some(session) = session.upgrade()
                else {
                    return false;
                };
                let since_last_ping = session.last_ping().elapsed();
                if since_last_ping > session.min_ping_interval {
                    warn!(peer = session.peer(), "no ping for {:?}, closing session", since_last_ping);
                    session.close().await;
                    return false;
                }
                true
            }
        })
    }

    /// runs `tick` every `period` until it returns false or the session's connection is closed
    fn spawn_periodic<F, Fut>(&self, period: Duration, span: tracing::Span, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = bool> + Send,
    {
        let mut closed = self.conn.closed_signal();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = ticker.tick() => {}
                    _ = closed.wait() => {
                        debug!("session closed, stopping");
                        return;
                    }
                }
                if !tick().await {
                    return;
                }
            }
        }.instrument(span))
    }

    /// Returns a fresh id for a frontend session. Ids start at 101 and increase; after wrapping
    ///  around, the reserved range is skipped.
    pub fn new_frontend_id(&self) -> u32 {
        loop {
            let id = self.id_counter.fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1)
                .wrapping_add(FRONTEND_ID_BASE);
            if id > FRONTEND_ID_BASE {
                return id;
            }
        }
    }

    /// Registers a bound frontend session. This fails once the session started closing, so no
    ///  frontend can be left behind by [BackendSession::close].
    pub async fn add_frontend(&self, frontend: Arc<FrontendSession>, id: u32) -> anyhow::Result<()> {
        let mut frontends = self.frontends.write().await;
        if !self.state.is_open() {
            bail!("backend session {} is closed", self.id);
        }
        trace!(backend = self.id, frontend = id, "adding frontend session");
        frontends.insert(id, frontend);
        Ok(())
    }

    pub async fn get_frontend(&self, id: u32) -> Option<Arc<FrontendSession>> {
        self.frontends.read().await
            .get(&id)
            .cloned()
    }

    pub async fn remove_frontend(&self, id: u32) -> Option<Arc<FrontendSession>> {
        trace!(backend = self.id, frontend = id, "removing frontend session");
        self.frontends.write().await
            .remove(&id)
    }

    pub async fn num_frontends(&self) -> usize {
        self.frontends.read().await.len()
    }

    /// Closes every bound frontend session and the connection. Only the first call does anything;
    ///  it returns `true`, all others return `false`.
    pub async fn close(&self) -> bool {
        if !self.state.begin_close() {
            return false;
        }
        info!(backend = self.id, peer = self.peer(), "closing backend session");

        let frontends = self.frontends.write().await
            .drain()
            .map(|(_, f)| f)
            .collect::<Vec<_>>();
        debug!(backend = self.id, "closing {} frontend sessions", frontends.len());
        for frontend in frontends {
            frontend.close().await;
        }

        self.conn.close().await;
        self.state.finish_close();
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use tokio::time::{advance, timeout};

    use crate::test_util::{backend_pair, frontend_pair, test_config};
    use super::*;

    #[tokio::test]
    async fn test_unique_frontend_ids() {
        let (backend, _peer) = backend_pair();
        let mut ids = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..50 {
            let (frontend, client) = frontend_pair();
            ids.push(frontend.bind(&backend).await.unwrap());
            clients.push(client);
        }

        assert_eq!(ids[0], 101);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids.iter().collect::<BTreeSet<_>>().len(), 50);
        assert_eq!(backend.num_frontends().await, 50);
    }

    #[tokio::test]
    async fn test_frontend_id_skips_reserved_range_on_wraparound() {
        let (backend, _peer) = backend_pair();
        backend.id_counter.store(u32::MAX - FRONTEND_ID_BASE - 1, Ordering::Relaxed);

        assert_eq!(backend.new_frontend_id(), u32::MAX);
        assert_eq!(backend.new_frontend_id(), FRONTEND_ID_BASE + 1);
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let (backend, _peer) = backend_pair();
        let mut frontends = Vec::new();
        for _ in 0..5 {
            let (frontend, client) = frontend_pair();
            frontend.bind(&backend).await.unwrap();
            frontends.push((frontend, client));
        }

        let closers = (0..10)
            .map(|_| {
                let backend = backend.clone();
                tokio::spawn(async move { backend.close().await })
            })
            .collect::<Vec<_>>();

        let mut num_closed = 0;
        for closer in closers {
            if closer.await.unwrap() {
                num_closed += 1;
            }
        }
        assert_eq!(num_closed, 1);
        assert_eq!(backend.state(), SessionState::Closed);
        assert_eq!(backend.num_frontends().await, 0);
        for (frontend, _) in &frontends {
            assert!(frontend.is_closed());
            // closed exactly once, by the backend
            assert!(!frontend.close().await);
        }
        assert!(backend.conn().is_closed());
    }

    #[tokio::test]
    async fn test_no_frontends_after_close() {
        let (backend, _peer) = backend_pair();
        backend.close().await;

        let (frontend, _client) = frontend_pair();
        assert!(frontend.bind(&backend).await.is_err());
        assert_eq!(frontend.id(), 0);
        assert!(backend.write(Packet::ping().as_bytes()).await.is_err());
    }

    #[tokio::test]
    async fn test_debug() {
        let (backend, _peer) = backend_pair();
        assert_eq!(format!("{:?}", backend), "BackendSession{id:1, peer:peer, state:Open}");
        backend.close().await;
        assert_eq!(format!("{:?}", backend), "BackendSession{id:1, peer:peer, state:Closed}");
    }

    #[tokio::test]
    async fn test_handle_control() {
        let (backend, _peer) = backend_pair();
        backend.handle_control(&Packet::register(4711));
        assert_eq!(backend.peer_id(), Some(4711));

        // unknown commands are dropped without affecting the session
        let mut unknown = Packet::ping();
        unknown.set_proto_id(0x0077);
        backend.handle_control(&unknown);
        assert_eq!(backend.state(), SessionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_closes_stale_session() {
        let (backend, _peer) = backend_pair();
        backend.start_ping_watchdog();

        let start = Instant::now();
        backend.conn().wait_closed().await;

        // the first check sees a ping timestamp exactly one interval old, which is still fine
        assert_eq!(start.elapsed(), 2 * test_config().min_ping_interval);
        assert!(backend.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_keeps_pinged_session() {
        let (backend, _peer) = backend_pair();
        let watchdog = backend.start_ping_watchdog();

        for _ in 0..10 {
            advance(Duration::from_secs(10)).await;
            backend.update_ping();
        }
        tokio::task::yield_now().await;
        assert!(!backend.is_closed());

        backend.close().await;
        timeout(Duration::from_secs(1), watchdog).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_sender() {
        let (backend, peer) = backend_pair();
        let sender = backend.start_ping();

        let start = Instant::now();
        for i in 1..=3 {
            let packet = peer.read_request().await.unwrap();
            assert_eq!(packet.as_bytes(), Packet::ping().as_bytes());
            assert_eq!(start.elapsed(), i * test_config().ping_send_interval());
        }

        backend.close().await;
        timeout(Duration::from_secs(1), sender).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_failure_closes_session() {
        let (backend, peer) = backend_pair();
        backend.start_ping();
        peer.close().await;

        backend.conn().wait_closed().await;
        assert!(backend.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_returns_when_requests_complete() {
        let (backend, _peer) = backend_pair();
        for delay in [1, 2, 2] {
            let guard = backend.add_request();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                drop(guard);
            });
        }
        assert_eq!(backend.num_requests_in_flight(), 3);

        let start = Instant::now();
        let drained = timeout(Duration::from_secs(5), backend.wait_requests_done()).await;
        assert!(drained.is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_is_bounded() {
        let (backend, _peer) = backend_pair();
        for delay in [1, 2, 60] {
            let guard = backend.add_request();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                drop(guard);
            });
        }

        let start = Instant::now();
        let drained = timeout(Duration::from_secs(5), backend.wait_requests_done()).await;
        assert!(drained.is_err());
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(backend.num_requests_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_request_guard_released_on_panic() {
        let (backend, _peer) = backend_pair();
        let guard = backend.add_request();
        let result = tokio::spawn(async move {
            let _guard = guard;
            panic!("dispatch failed");
        }).await;

        assert!(result.is_err());
        assert_eq!(backend.num_requests_in_flight(), 0);
        backend.wait_requests_done().await;
    }
}
