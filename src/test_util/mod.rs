//! Utilities for testing code built on the tunnel: in-memory session pairs, packet builders and a
//!  router with scripted behavior. They are used for testing the tunnel itself, but they are also
//!  exported for application testing, so they are part of the crate's regular code.

pub mod router;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::duplex;

use crate::config::TunnelConfig;
use crate::packet::compress::NoneCompressor;
use crate::packet::packet::Packet;
use crate::pool::buffer_pool::PooledBuf;
use crate::pool::SessionPools;
use crate::tunnel::backend::BackendSession;
use crate::tunnel::conn::TunnelConn;
use crate::tunnel::frontend::FrontendSession;

pub use router::EchoRouter;

/// A config with small pools and a read timeout that outlasts the ping interval, so idle sessions
///  stay up in tests with paused time
pub fn test_config() -> TunnelConfig {
    TunnelConfig {
        min_ping_interval: Duration::from_secs(20),
        read_timeout: Duration::from_secs(30),
        write_timeout: Duration::from_secs(10),
        response_timeout: Duration::from_secs(10),
        dispatch_timeout: Duration::from_secs(60),
        drain_grace_period: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        packet_pool_size: 16,
        read_buffer_size: 64*1024,
        read_buffer_pool_size: 4,
        zlib_pool_size: 2,
        compression_threshold: 256,
        crypto_secret: b"tunnelmux".to_vec(),
        sign_secret: b"test secret".to_vec(),
        poison_freed_buffers: true,
    }
}

pub fn test_pools() -> Arc<SessionPools> {
    SessionPools::new(&test_config())
}

/// Two backend sessions connected to each other in memory. The second one plays the peer.
pub fn backend_pair() -> (Arc<BackendSession>, Arc<BackendSession>) {
    let config = test_config();
    let (a, b) = duplex(64*1024);
    let session = BackendSession::new(1, TunnelConn::new(a, "peer", &config, test_pools()).unwrap(), &config);
    let peer = BackendSession::new(2, TunnelConn::new(b, "session", &config, test_pools()).unwrap(), &config);
    (session, peer)
}

/// An unbound frontend session and the client's end of its connection
pub fn frontend_pair() -> (Arc<FrontendSession>, TunnelConn) {
    let config = test_config();
    let (a, b) = duplex(64*1024);
    let frontend = FrontendSession::new(TunnelConn::new(a, "client", &config, test_pools()).unwrap());
    let client = TunnelConn::new(b, "frontend", &config, test_pools()).unwrap();
    (frontend, client)
}

/// A copy of a packet in a pooled buffer, the way packets come off a connection
pub fn pooled_packet<B: AsRef<[u8]>>(pools: &SessionPools, packet: &Packet<B>) -> Packet<PooledBuf> {
    let mut buf = pools.packets.allocate(packet.len()).unwrap();
    buf.extend_from_slice(packet.as_bytes());
    Packet::from_bytes(buf).unwrap()
}

/// An unsigned, uncompressed data packet
pub fn request_packet(conn_id: u32, mid: u8, aid: u8, payload: &[u8]) -> Packet {
    let mut packet = Packet::from_payload(payload, None, &NoneCompressor).unwrap();
    packet.set_conn_id(conn_id);
    packet.set_mid(mid);
    packet.set_aid(aid);
    packet
}
