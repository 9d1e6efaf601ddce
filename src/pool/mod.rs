pub mod buffer_pool;
pub mod zlib_pool;

use std::sync::Arc;

use crate::config::TunnelConfig;
use crate::packet::compress::ZlibCompressor;
use crate::packet::packet::MAX_PACKET_SIZE;
use crate::pool::buffer_pool::BufferPool;
use crate::pool::zlib_pool::ZlibWriterPool;

/// The pools a session draws from. They are created once at startup and handed to every session
///  explicitly, so separate services (and tests) can have isolated pools.
pub struct SessionPools {
    /// buffers for single packets, each big enough for the largest legal packet
    pub packets: Arc<BufferPool>,
    /// per-connection read buffers
    pub read_buffers: Arc<BufferPool>,
    pub zlib_writers: Arc<ZlibWriterPool>,
}

impl SessionPools {
    pub fn new(config: &TunnelConfig) -> Arc<SessionPools> {
        Arc::new(SessionPools {
            packets: BufferPool::new(MAX_PACKET_SIZE, config.packet_pool_size, config.poison_freed_buffers),
            read_buffers: BufferPool::new(config.read_buffer_size, config.read_buffer_pool_size, config.poison_freed_buffers),
            zlib_writers: ZlibWriterPool::new(config.zlib_pool_size),
        })
    }

    /// a compressor for payloads above the configured threshold, drawing writers from this pool
    pub fn compressor(&self, config: &TunnelConfig) -> ZlibCompressor {
        ZlibCompressor::new(config.compression_threshold, self.zlib_writers.clone())
    }
}
