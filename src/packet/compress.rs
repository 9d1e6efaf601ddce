use std::io::Read;
use std::sync::Arc;

use anyhow::{bail, Context};
use flate2::read::ZlibDecoder;
use tracing::trace;

use crate::packet::packet::MAX_PACKET_SIZE;
use crate::pool::zlib_pool::ZlibWriterPool;

/// Optional payload compression, applied before anything else when a packet is built
pub trait Compressor: Send + Sync {
    /// `None` means the payload is to be sent as is; `Some` holds the complete compressed payload
    fn compress(&self, data: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
}

pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, _data: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Compresses payloads longer than `min_size`, borrowing a writer from the pool for the duration
///  of a single call
pub struct ZlibCompressor {
    min_size: usize,
    pool: Arc<ZlibWriterPool>,
}

impl ZlibCompressor {
    pub fn new(min_size: usize, pool: Arc<ZlibWriterPool>) -> ZlibCompressor {
        ZlibCompressor {
            min_size,
            pool,
        }
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&self, data: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if data.len() <= self.min_size {
            return Ok(None);
        }
        let compressed = self.pool.get().compress(data)?;
        trace!("compressed payload from {} to {} bytes", data.len(), compressed.len());
        Ok(Some(compressed))
    }
}

/// Inflates a payload that was sent with the ZLIB flag. The tunnel never calls this itself, it
///  is a helper for code consuming payloads.
pub fn zlib_decompress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    // bounded, so a malicious packet can not inflate without limit
    let limit = (16 * MAX_PACKET_SIZE) as u64;
    ZlibDecoder::new(data)
        .take(limit + 1)
        .read_to_end(&mut out)
        .context("zlib decompress failed")?;
    if out.len() as u64 > limit {
        bail!("decompressed payload exceeds {} bytes", limit);
    }
    Ok(out)
}
