use std::time::Duration;

use anyhow::bail;

use crate::packet::crypto::XorCrypto;
use crate::packet::packet::MAX_PACKET_SIZE;
use crate::packet::signature::HmacSha1Signature;

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Reference interval for keepalive on a backend session: the ping sender fires every
    ///  `min_ping_interval - 2s`, the watchdog every `min_ping_interval`, and a session that has
    ///  not received a ping for longer than `min_ping_interval` is considered dead.
    pub min_ping_interval: Duration,

    pub read_timeout: Duration,
    pub write_timeout: Duration,

    /// how long a frontend session waits for the response to a forwarded request
    pub response_timeout: Duration,
    /// outer bound on a single router dispatch, on top of whatever timeout the router applies
    ///  internally
    pub dispatch_timeout: Duration,
    /// when a backend session's read loop ends, in-flight requests get this long to complete
    ///  before the session is closed regardless
    pub drain_grace_period: Duration,
    pub connect_timeout: Duration,

    /// number of packet buffers (of [MAX_PACKET_SIZE] bytes each) kept in the pool
    pub packet_pool_size: usize,
    pub read_buffer_size: usize,
    pub read_buffer_pool_size: usize,
    pub zlib_pool_size: usize,

    /// payloads longer than this are zlib compressed when a compressing encoder is used
    pub compression_threshold: usize,

    /// secret for the XOR obfuscation; the first two bytes replace zero key bytes
    pub crypto_secret: Vec<u8>,
    /// secret for HMAC-SHA1 payload signatures, concatenated with a per-session token
    pub sign_secret: Vec<u8>,

    /// overwrite buffers returned to the pool, so stale data can not leak through a recycled
    ///  buffer
    pub poison_freed_buffers: bool,
}

impl TunnelConfig {
    pub fn new() -> TunnelConfig {
        TunnelConfig {
            min_ping_interval: Duration::from_secs(20),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            dispatch_timeout: Duration::from_secs(10),
            drain_grace_period: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            packet_pool_size: 512,
            read_buffer_size: 64*1024,
            read_buffer_pool_size: 1000,
            zlib_pool_size: 64,
            compression_threshold: 256,
            crypto_secret: b"tunnelmux".to_vec(),
            sign_secret: b"no secret".to_vec(),
            poison_freed_buffers: cfg!(debug_assertions),
        }
    }

    pub fn ping_send_interval(&self) -> Duration {
        self.min_ping_interval.saturating_sub(Duration::from_secs(2))
    }

    pub fn crypto(&self) -> anyhow::Result<XorCrypto> {
        XorCrypto::new(&self.crypto_secret)
    }

    pub fn signature(&self) -> HmacSha1Signature {
        HmacSha1Signature::new(&self.sign_secret)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_ping_interval <= Duration::from_secs(2) {
            bail!("min ping interval must be longer than 2 seconds, was {:?}", self.min_ping_interval);
        }
        if self.read_buffer_size < MAX_PACKET_SIZE {
            bail!("read buffer size {} is smaller than the maximum packet size {}", self.read_buffer_size, MAX_PACKET_SIZE);
        }
        if self.packet_pool_size == 0 || self.read_buffer_pool_size == 0 || self.zlib_pool_size == 0 {
            bail!("pool sizes must be positive");
        }
        if self.crypto_secret.len() < 2 || self.crypto_secret[0] == 0 || self.crypto_secret[1] == 0 {
            bail!("crypto secret must have at least two bytes, and the first two must not be zero");
        }
        Ok(())
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self::new()
    }
}
