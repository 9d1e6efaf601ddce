use std::sync::{Arc, Mutex, MutexGuard};

use flate2::{Compress, Compression, FlushCompress, Status};
use tracing::{debug, trace};

/// A pool of zlib compression states. Setting up a deflate state allocates a few hundred KiB, so
///  they are reset and reused rather than created per packet.
pub struct ZlibWriterPool {
    level: Compression,
    writers: Mutex<Vec<Compress>>,
}

impl ZlibWriterPool {
    pub fn new(max_pool_size: usize) -> Arc<Self> {
        Arc::new(ZlibWriterPool {
            level: Compression::default(),
            writers: Mutex::new(Vec::with_capacity(max_pool_size)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Compress>> {
        self.writers.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(self: &Arc<Self>) -> ZlibWriter {
        let pooled = self.lock().pop();
        let compress = match pooled {
            Some(c) => {
                trace!("returning zlib writer from pool");
                c
            }
            None => {
                debug!("no zlib writer in pool: creating new writer");
                Compress::new(self.level, true)
            }
        };

        ZlibWriter {
            compress: Some(compress),
            pool: self.clone(),
        }
    }

    fn put(&self, mut compress: Compress) {
        compress.reset();
        let mut writers = self.lock();
        if writers.capacity() > writers.len() {
            writers.push(compress);
        }
        else {
            debug!("zlib writer pool is full: discarding returned writer");
        }
    }

    pub fn num_pooled(&self) -> usize {
        self.lock().len()
    }
}

/// A zlib writer borrowed from a [ZlibWriterPool] for a single compress call; it goes back to the
///  pool when dropped.
pub struct ZlibWriter {
    compress: Option<Compress>,
    pool: Arc<ZlibWriterPool>,
}

impl ZlibWriter {
    /// Compresses `data` into a complete zlib stream (header, deflate data, adler32 trailer)
    pub fn compress(&mut self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let compress = self.compress.as_mut()
            .ok_or_else(|| anyhow::anyhow!("zlib writer was already returned"))?;

        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        loop {
            let consumed = compress.total_in() as usize;
            match compress.compress_vec(&data[consumed..], &mut out, FlushCompress::Finish)? {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    let additional = out.capacity().max(64);
                    out.reserve(additional);
                }
            }
        }
        Ok(out)
    }
}

impl Drop for ZlibWriter {
    fn drop(&mut self) {
        if let Some(compress) = self.compress.take() {
            self.pool.put(compress);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use flate2::read::ZlibDecoder;
    use super::*;

    fn inflate(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        ZlibDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_compress_and_reuse() {
        let pool = ZlibWriterPool::new(2);
        let input = b"abcabcabcabcabcabcabcabcabcabcabcabcabcabcabc".repeat(20);

        let first = {
            let mut writer = pool.get();
            writer.compress(&input).unwrap()
        };
        assert_eq!(pool.num_pooled(), 1);
        assert!(first.len() < input.len());
        assert_eq!(inflate(&first), input);

        // a recycled writer starts a fresh stream
        let second = pool.get().compress(&input).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_input() {
        let pool = ZlibWriterPool::new(1);
        let compressed = pool.get().compress(b"").unwrap();
        assert!(inflate(&compressed).is_empty());
    }
}
