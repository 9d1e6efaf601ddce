use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::packet::packet::Packet;
use crate::pool::buffer_pool::PooledBuf;
use crate::tunnel::backend::BackendSession;
use crate::tunnel::conn::TunnelConn;
use crate::tunnel::state::AtomicSessionState;

/// Single-fire notification that the response to an outstanding request was delivered. It is
///  armed per request; firing it without an armed request is reported as an error rather than
///  silently ignored.
#[derive(Default)]
pub struct ResponseSignal {
    inner: Mutex<SignalState>,
}

#[derive(Default)]
struct SignalState {
    tx: Option<oneshot::Sender<()>>,
    rx: Option<oneshot::Receiver<()>>,
}

impl ResponseSignal {
    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.inner.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Arms the signal for a new request. A previous request that is still being waited for is
    ///  abandoned: its waiter returns `false`.
    pub fn arm(&self) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        state.tx = Some(tx);
        state.rx = Some(rx);
    }

    pub fn fire(&self) -> anyhow::Result<()> {
        let tx = self.lock().tx.take()
            .ok_or_else(|| anyhow!("response signalled without an outstanding request"))?;
        // the waiter may have timed out already
        let _ = tx.send(());
        Ok(())
    }

    /// `Ok(true)` if the response arrived in time, `Ok(false)` on timeout or if the request was
    ///  abandoned
    pub async fn wait(&self, timeout: Duration) -> anyhow::Result<bool> {
        let rx = self.lock().rx.take()
            .ok_or_else(|| anyhow!("no outstanding request to wait for"))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Ok(false),
            Err(_) => Ok(false),
        }
    }

    /// wakes up a pending waiter without a response
    fn cancel(&self) {
        self.lock().tx.take();
    }
}

#[derive(Default)]
struct Binding {
    id: u32,
    backend: Option<Weak<BackendSession>>,
}

/// One client-facing connection. It is bound to (at most) one backend session, which assigns
///  its id; the id is the connection id that tags its traffic inside the tunnel.
pub struct FrontendSession {
    conn: TunnelConn,
    state: AtomicSessionState,
    binding: Mutex<Binding>,
    response: ResponseSignal,
}

impl FrontendSession {
    pub fn new(conn: TunnelConn) -> Arc<FrontendSession> {
        Arc::new(FrontendSession {
            conn,
            state: AtomicSessionState::new(),
            binding: Default::default(),
            response: Default::default(),
        })
    }

    fn binding(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// 0 while unbound
    pub fn id(&self) -> u32 {
        self.binding().id
    }

    pub fn peer(&self) -> &str {
        self.conn.peer()
    }

    pub fn backend(&self) -> Option<Arc<BackendSession>> {
        self.binding().backend.as_ref()
            .and_then(|b| b.upgrade())
    }

    pub fn is_closed(&self) -> bool {
        !self.state.is_open()
    }

    /// Binds this session to a backend session, which assigns the session's id and registers it.
    ///  Binding a session that is already bound has no effect and returns the existing id.
    pub async fn bind(self: &Arc<Self>, backend: &Arc<BackendSession>) -> anyhow::Result<u32> {
        let id = {
            let mut binding = self.binding();
            if binding.backend.is_some() {
                return Ok(binding.id);
            }
            let id = backend.new_frontend_id();
            binding.id = id;
            binding.backend = Some(Arc::downgrade(backend));
            id
        };

        if let Err(e) = backend.add_frontend(self.clone(), id).await {
            let mut binding = self.binding();
            if binding.id == id {
                *binding = Binding::default();
            }
            return Err(e);
        }
        debug!(frontend = id, backend = backend.id(), peer = self.peer(), "bound frontend session");
        Ok(id)
    }

    /// Removes this session from its backend session's registry. Unbinding an unbound session is
    ///  a no-op.
    pub async fn unbind(&self) {
        let Binding { id, backend } = std::mem::take(&mut *self.binding());
        if let Some(backend) = backend.and_then(|b| b.upgrade()) {
            trace!(frontend = id, backend = backend.id(), "unbinding frontend session");
            backend.remove_frontend(id).await;
        }
    }

    pub async fn read_packet(&self) -> anyhow::Result<Packet<PooledBuf>> {
        self.conn.read_packet().await
    }

    pub async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        self.conn.write_packet(data).await
    }

    /// arms the response signal for the request that is about to be forwarded
    pub fn expect_response(&self) {
        self.response.arm()
    }

    pub async fn wait_for_response(&self, timeout: Duration) -> anyhow::Result<bool> {
        let arrived = self.response.wait(timeout).await?;
        if !arrived {
            warn!(frontend = self.id(), peer = self.peer(), "no response within {:?}", timeout);
        }
        Ok(arrived)
    }

    pub fn done_response(&self) -> anyhow::Result<()> {
        self.response.fire()
    }

    /// Closes the client connection. Returns `true` for the call that actually closed it.
    pub async fn close(&self) -> bool {
        if !self.state.begin_close() {
            return false;
        }
        debug!(frontend = self.id(), peer = self.peer(), "closing frontend session");
        self.response.cancel();
        self.conn.close().await;
        self.state.finish_close();
        true
    }

    /// the client went away: unregister, then close
    pub async fn disconnect(&self) {
        self.unbind().await;
        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use crate::test_util::{backend_pair, frontend_pair};
    use super::*;

    #[tokio::test]
    async fn test_bind_is_idempotent() {
        let (backend, _peer) = backend_pair();
        let (frontend, _client) = frontend_pair();
        assert_eq!(frontend.id(), 0);

        let id = frontend.bind(&backend).await.unwrap();
        assert_eq!(id, 101);
        assert_eq!(frontend.bind(&backend).await.unwrap(), id);
        assert_eq!(frontend.id(), id);
        assert_eq!(backend.num_frontends().await, 1);
        assert!(Arc::ptr_eq(&backend.get_frontend(id).await.unwrap(), &frontend));
    }

    #[tokio::test]
    async fn test_unbind_and_rebind() {
        let (first, _peer1) = backend_pair();
        let (second, _peer2) = backend_pair();
        let (frontend, _client) = frontend_pair();

        // unbinding an unbound session is a no-op
        frontend.unbind().await;

        let id = frontend.bind(&first).await.unwrap();
        frontend.unbind().await;
        assert_eq!(frontend.id(), 0);
        assert!(frontend.backend().is_none());
        assert!(first.get_frontend(id).await.is_none());

        frontend.bind(&second).await.unwrap();
        assert_eq!(second.num_frontends().await, 1);
        assert!(Arc::ptr_eq(&frontend.backend().unwrap(), &second));
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (backend, _peer) = backend_pair();
        let (frontend, _client) = frontend_pair();
        let id = frontend.bind(&backend).await.unwrap();

        frontend.disconnect().await;
        assert!(frontend.is_closed());
        assert!(backend.get_frontend(id).await.is_none());
        assert!(!frontend.close().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_signal() {
        let (frontend, _client) = frontend_pair();
        frontend.expect_response();

        let waiter = tokio::spawn({
            let frontend = frontend.clone();
            async move { frontend.wait_for_response(Duration::from_secs(10)).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        frontend.done_response().unwrap();
        assert!(waiter.await.unwrap().unwrap());

        // single fire
        assert!(frontend.done_response().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout() {
        let (frontend, _client) = frontend_pair();
        frontend.expect_response();

        let start = Instant::now();
        assert!(!frontend.wait_for_response(Duration::from_secs(10)).await.unwrap());
        assert_eq!(start.elapsed(), Duration::from_secs(10));

        // a late response is still consumed, but nobody is waiting for it
        assert!(frontend.done_response().is_ok());
        assert!(frontend.done_response().is_err());
    }

    #[tokio::test]
    async fn test_wait_without_request() {
        let (frontend, _client) = frontend_pair();
        assert!(frontend.wait_for_response(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_close_cancels_wait() {
        let (frontend, _client) = frontend_pair();
        frontend.expect_response();

        let waiter = tokio::spawn({
            let frontend = frontend.clone();
            async move { frontend.wait_for_response(Duration::from_secs(10)).await }
        });
        tokio::task::yield_now().await;
        assert!(frontend.close().await);
        assert!(!waiter.await.unwrap().unwrap());
    }
}
