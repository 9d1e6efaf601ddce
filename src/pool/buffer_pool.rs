use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::bail;
use bytes::BytesMut;
use tracing::{debug, trace};

/// Byte that freed buffers are overwritten with when poisoning is enabled, so stale packet
///  contents can never resurface through a recycled buffer
pub const POISON: u8 = 0xDB;

/// A pool of equally sized byte buffers. Buffers are handed out as [PooledBuf], which goes back
///  to its pool when it is freed (explicitly or by being dropped).
pub struct BufferPool {
    buf_size: usize,
    poison_on_free: bool,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize, poison_on_free: bool) -> Arc<Self> {
        Arc::new(BufferPool {
            buf_size,
            poison_on_free,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BytesMut>> {
        self.buffers.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Returns an empty buffer with room for at least `size` bytes
    pub fn allocate(self: &Arc<Self>, size: usize) -> anyhow::Result<PooledBuf> {
        if size > self.buf_size {
            bail!("requested buffer of {} bytes exceeds the pool's buffer size of {}", size, self.buf_size);
        }

        let pooled = self.lock().pop();
        let buf = match pooled {
            Some(mut buf) => {
                trace!("returning buffer from pool");
                buf.clear();
                buf
            }
            None => {
                debug!("no buffer in pool: creating new buffer");
                BytesMut::with_capacity(self.buf_size)
            }
        };

        Ok(PooledBuf {
            buf: Some(buf),
            pool: self.clone(),
        })
    }

    fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.buf_size {
            debug!("returned buffer shrank below the pool's buffer size: discarding it");
            return;
        }

        buffer.clear();
        if self.poison_on_free {
            let capacity = buffer.capacity();
            buffer.resize(capacity, POISON);
        }

        let mut buffers = self.lock();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    pub fn num_pooled(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    fn pooled_contents(&self) -> Vec<Vec<u8>> {
        self.lock().iter()
            .map(|b| b.to_vec())
            .collect()
    }
}

/// A buffer borrowed from a [BufferPool].
///
/// Freeing consumes the buffer, so no packet view borrowed from it can outlive the call to
///  [PooledBuf::free].
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Returns the buffer to its pool. Dropping a [PooledBuf] has the same effect.
    pub fn free(self) {
        drop(self)
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.return_to_pool(buf);
        }
    }
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        // only ever None during drop
        self.buf.as_ref().expect("buffer is present until dropped")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().expect("buffer is present until dropped")
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.deref().as_ref()
    }
}

impl AsMut<[u8]> for PooledBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self.deref_mut().as_mut()
    }
}

impl Debug for PooledBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledBuf{{len:{}}}", self.buf.as_ref().map(|b| b.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use super::*;

    #[test]
    fn test_clear() {
        let pool = BufferPool::new(10, 10, false);

        let mut buf = pool.allocate(10).unwrap();
        buf.put_u8(1);
        buf.free();

        assert_eq!(pool.num_pooled(), 1);
        assert!(pool.allocate(4).unwrap().is_empty());
    }

    #[test]
    fn test_too_big() {
        let pool = BufferPool::new(10, 10, false);
        assert!(pool.allocate(11).is_err());
    }

    #[test]
    fn test_pool_full() {
        let pool = BufferPool::new(10, 1, false);
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(1).unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.num_pooled(), 1);
    }

    #[test]
    fn test_poison_on_free() {
        let pool = BufferPool::new(16, 4, true);

        let mut buf = pool.allocate(16).unwrap();
        buf.put_slice(b"secret payload!!");
        buf.free();

        let pooled = pool.pooled_contents();
        assert_eq!(pooled.len(), 1);
        assert_eq!(pooled[0].len(), 16);
        assert!(pooled[0].iter().all(|&b| b == POISON));

        // a recycled buffer starts out empty and never exposes the previous contents
        let recycled = pool.allocate(16).unwrap();
        assert!(recycled.is_empty());
        assert!(!recycled.as_ref().windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn test_shrunk_buffer_is_discarded() {
        let pool = BufferPool::new(16, 4, false);
        let mut buf = pool.allocate(16).unwrap();
        buf.put_slice(&[1u8; 16]);
        let _ = buf.split_to(8);
        drop(buf);
        assert_eq!(pool.num_pooled(), 0);
    }
}
