use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use tracing::{debug, instrument, trace, warn, Instrument};

use crate::packet::crypto::PacketCrypto;
use crate::packet::packet::{Packet, PacketKind};
use crate::pool::buffer_pool::PooledBuf;
use crate::session::request::Request;
use crate::session::response::Response;
use crate::session::router::BytesResult;
use crate::tunnel::backend::BackendSession;
use crate::tunnel::conn::{is_malformed, is_timeout};
use crate::tunnel::frontend::FrontendSession;

/// Moves traffic between clients and the tunnel on the agent side: client requests are
///  decrypted, tagged with the client's frontend id and written to the tunnel; responses coming
///  back are matched to the client by that id, encrypted and written to the client.
pub struct Forwarder {
    crypto: Arc<dyn PacketCrypto>,
    response_timeout: Duration,
}

impl Forwarder {
    pub fn new(crypto: Arc<dyn PacketCrypto>, response_timeout: Duration) -> Forwarder {
        Forwarder {
            crypto,
            response_timeout,
        }
    }

    /// Serves a client connection: binds it to the backend session, then forwards its requests one
    ///  at a time, each waiting for its response (or the response timeout) before the next one is
    ///  read. The client is disconnected when its connection breaks.
    #[instrument(skip_all, fields(peer = %frontend.peer(), backend = backend.id()))]
    pub async fn serve_client(&self, frontend: Arc<FrontendSession>, backend: &Arc<BackendSession>) -> anyhow::Result<()> {
        if let Err(e) = frontend.bind(backend).await {
            frontend.close().await;
            return Err(e);
        }

        loop {
            match frontend.read_packet().await {
                Ok(packet) => {
                    if let Err(e) = self.forward(&frontend, packet).await {
                        warn!("failed to forward request: {}", e);
                        break;
                    }
                }
                Err(e) if is_malformed(&e) => {
                    debug!("dropping malformed packet from client: {}", e);
                }
                Err(e) => {
                    debug!("client connection ended: {}", e);
                    break;
                }
            }
        }

        frontend.disconnect().await;
        Ok(())
    }

    /// Forwards a single client packet through the tunnel and waits for the response. Returns
    ///  whether a response arrived; packets that are not routed requests are dropped.
    ///
    /// Responses are matched to clients by connection id only. A response that arrives after its
    ///  request timed out is still delivered to the client, and if the client has sent its next
    ///  request by then, it completes that request's wait.
    pub async fn forward(&self, frontend: &FrontendSession, packet: Packet<PooledBuf>) -> anyhow::Result<bool> {
        let request = match Request::from_client(packet, self.crypto.as_ref()) {
            Ok(request) => request,
            Err(e) => {
                debug!("dropping client packet: {}", e);
                return Ok(false);
            }
        };
        let backend = frontend.backend()
            .ok_or_else(|| anyhow!("frontend session is not bound to a backend session"))?;

        let mut packet = request.into_packet();
        packet.set_conn_id(frontend.id());
        trace!("forwarding {:?}", packet);

        frontend.expect_response();
        backend.write(packet.as_bytes()).await?;
        drop(packet);

        frontend.wait_for_response(self.response_timeout).await
    }

    /// Reads responses from the tunnel and hands each to the client it belongs to, until the
    ///  tunnel breaks. Read timeouts are expected on an idle tunnel; liveness is the ping
    ///  sender's concern.
    #[instrument(skip_all, fields(backend = backend.id()))]
    pub async fn relay_responses(&self, backend: Arc<BackendSession>) {
        loop {
            match backend.read_request().await {
                Ok(packet) => self.relay(&backend, packet).await,
                Err(e) if is_malformed(&e) => {
                    debug!("dropping malformed packet from backend: {}", e);
                }
                Err(e) if is_timeout(&e) && !backend.is_closed() => {
                    trace!("no traffic from backend");
                }
                Err(e) => {
                    debug!("tunnel connection ended: {}", e);
                    break;
                }
            }
        }
        backend.close().await;
    }

    pub async fn relay(&self, backend: &BackendSession, packet: Packet<PooledBuf>) {
        if let PacketKind::Command(_) = packet.kind() {
            backend.handle_control(&packet);
            return;
        }

        let conn_id = packet.conn_id();
        let Some(frontend) = backend.get_frontend(conn_id).await
        else {
            debug!(conn_id, "no client for response - dropping it");
            return;
        };

        let response = match Request::from_agent(packet) {
            Ok(response) => response,
            Err(e) => {
                debug!(conn_id, "dropping response: {}", e);
                return;
            }
        };
        let result = BytesResult(Bytes::copy_from_slice(response.data()));
        let encoded = Response {
            mid: response.mid(),
            aid: response.aid(),
            ver: response.proto_ver(),
            flag: response.data_flag(),
            result: &result,
        };
        let packet = match encoded.encode_for_client(self.crypto.as_ref()) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(conn_id, "failed to encode response: {}", e);
                return;
            }
        };
        drop(response);

        // client writes run on tasks of their own, so a stalled client can not hold up the tunnel
        tokio::spawn(async move {
            if let Err(e) = frontend.write(packet.as_bytes()).await {
                warn!(conn_id, "failed to write response to client: {}", e);
            }
            if let Err(e) = frontend.done_response() {
                warn!(conn_id, "{}", e);
            }
        }.in_current_span());
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;
    use tokio::time::Instant;

    use crate::packet::crypto::XorCrypto;
    use crate::test_util::{backend_pair, pooled_packet, request_packet, test_config, test_pools};
    use crate::tunnel::conn::TunnelConn;
    use super::*;

    fn forwarder() -> Forwarder {
        Forwarder::new(Arc::new(XorCrypto::new(b"tunnelmux").unwrap()), Duration::from_secs(10))
    }

    fn crypto() -> XorCrypto {
        XorCrypto::new(b"tunnelmux").unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (agent_side, backend_side) = backend_pair();
        let (client_side, frontend_side) = duplex(64*1024);
        let client = TunnelConn::new(client_side, "client", &test_config(), test_pools()).unwrap();
        let frontend = FrontendSession::new(TunnelConn::new(frontend_side, "client", &test_config(), test_pools()).unwrap());

        let forwarder = Arc::new(forwarder());
        tokio::spawn({
            let forwarder = forwarder.clone();
            let agent_side = agent_side.clone();
            async move { forwarder.relay_responses(agent_side).await }
        });
        tokio::spawn({
            let forwarder = forwarder.clone();
            let frontend = frontend.clone();
            let agent_side = agent_side.clone();
            async move { forwarder.serve_client(frontend, &agent_side).await }
        });

        // the client sends an encrypted request
        let mut request = request_packet(0, 3, 4, b"question");
        request.encrypt(&crypto());
        client.write_packet(request.as_bytes()).await.unwrap();

        // it arrives decrypted and tagged with the frontend id
        let tunneled = backend_side.read_request().await.unwrap();
        assert_eq!(tunneled.conn_id(), 101);
        assert_eq!(tunneled.data_flag(), 0);
        assert_eq!(tunneled.data_load(), b"question");

        // the backend answers through the tunnel
        let mut answer = request_packet(tunneled.conn_id(), 3, 4, b"answer");
        answer.set_proto_ver(2);
        backend_side.write(answer.as_bytes()).await.unwrap();

        // the client gets it with conn id 0, encrypted
        let mut response = client.read_packet().await.unwrap();
        assert!(response.is_xor_encrypted());
        response.decrypt(&crypto());
        assert_eq!(response.conn_id(), 0);
        assert_eq!((response.mid(), response.aid(), response.proto_ver()), (3, 4, 2));
        assert_eq!(response.data_load(), b"answer");
    }

    #[tokio::test]
    async fn test_response_for_unknown_client_is_dropped() {
        let (agent_side, _backend_side) = backend_pair();
        let pools = test_pools();
        forwarder().relay(&agent_side, pooled_packet(&pools, &request_packet(999, 3, 4, b"lost"))).await;
        assert!(!agent_side.is_closed());
    }

    #[tokio::test]
    async fn test_relay_handles_ping() {
        let (agent_side, _backend_side) = backend_pair();
        let pools = test_pools();
        let before = agent_side.last_ping();
        tokio::time::sleep(Duration::from_millis(5)).await;

        forwarder().relay(&agent_side, pooled_packet(&pools, &Packet::ping())).await;
        assert!(agent_side.last_ping() > before);
    }

    #[tokio::test]
    async fn test_client_commands_are_not_forwarded() {
        let (agent_side, _backend_side) = backend_pair();
        let (frontend, _client) = crate::test_util::frontend_pair();
        frontend.bind(&agent_side).await.unwrap();

        let pools = test_pools();
        let forwarded = forwarder().forward(&frontend, pooled_packet(&pools, &Packet::ping())).await.unwrap();
        assert!(!forwarded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_client_does_not_block_others() {
        let (agent_side, backend_side) = backend_pair();
        // this client never reads, and its pipe is too small for its response
        let (_stalled_client, stalled_side) = duplex(16);
        let stalled = FrontendSession::new(TunnelConn::new(stalled_side, "stalled", &test_config(), test_pools()).unwrap());
        let (healthy, healthy_client) = crate::test_util::frontend_pair();
        let stalled_id = stalled.bind(&agent_side).await.unwrap();
        let healthy_id = healthy.bind(&agent_side).await.unwrap();

        tokio::spawn({
            let agent_side = agent_side.clone();
            async move { forwarder().relay_responses(agent_side).await }
        });

        backend_side.write(request_packet(stalled_id, 3, 4, &[9u8; 500]).as_bytes()).await.unwrap();
        backend_side.write(request_packet(healthy_id, 3, 4, b"healthy").as_bytes()).await.unwrap();

        let start = Instant::now();
        let mut response = healthy_client.read_packet().await.unwrap();
        assert!(start.elapsed() < test_config().write_timeout);
        response.decrypt(&crypto());
        assert_eq!(response.data_load(), b"healthy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_completes_next_request() {
        let (agent_side, backend_side) = backend_pair();
        let (frontend, client) = crate::test_util::frontend_pair();
        frontend.bind(&agent_side).await.unwrap();
        tokio::spawn({
            let agent_side = agent_side.clone();
            async move { forwarder().relay_responses(agent_side).await }
        });

        let pools = test_pools();
        let forwarder = Arc::new(forwarder());

        // nobody answers the first request in time
        let start = Instant::now();
        assert!(!forwarder.forward(&frontend, pooled_packet(&pools, &request_packet(0, 3, 4, b"first"))).await.unwrap());
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        let first = backend_side.read_request().await.unwrap();

        let forwarding = tokio::spawn({
            let forwarder = forwarder.clone();
            let frontend = frontend.clone();
            let second = pooled_packet(&pools, &request_packet(0, 3, 5, b"second"));
            async move { forwarder.forward(&frontend, second).await }
        });
        assert_eq!(backend_side.read_request().await.unwrap().data_load(), b"second");

        // the late answer to the first request ends the wait for the second one
        backend_side.write(request_packet(first.conn_id(), 3, 4, b"first answer").as_bytes()).await.unwrap();
        assert!(forwarding.await.unwrap().unwrap());

        let mut response = client.read_packet().await.unwrap();
        response.decrypt(&crypto());
        assert_eq!(response.data_load(), b"first answer");
    }

    #[tokio::test]
    async fn test_closing_backend_disconnects_clients() {
        let (agent_side, _backend_side) = backend_pair();
        let (client_side, frontend_side) = duplex(1024);
        let client = TunnelConn::new(client_side, "client", &test_config(), test_pools()).unwrap();
        let frontend = FrontendSession::new(TunnelConn::new(frontend_side, "client", &test_config(), test_pools()).unwrap());

        let serving = tokio::spawn({
            let agent_side = agent_side.clone();
            let frontend = frontend.clone();
            async move { forwarder().serve_client(frontend, &agent_side).await }
        });
        while agent_side.num_frontends().await == 0 {
            tokio::task::yield_now().await;
        }

        agent_side.close().await;
        serving.await.unwrap().unwrap();
        assert!(frontend.is_closed());
        assert!(client.read_packet().await.is_err());
    }
}
