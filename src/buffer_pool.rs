//! Byte buffer pool shared by every connection.
//!
//! Each connection draws its receive accumulator and outbound packet buffers
//! from a pool. The pool itself is lock-free, so connections running on
//! different threads can acquire and release buffers concurrently.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, LazyLock};

use crossbeam_queue::ArrayQueue;

const POOL_CAPACITY: usize = 256;

/// Initial capacity of a freshly allocated buffer.
const INITIAL_BUFFER_CAPACITY: usize = 8192;

/// Buffers that grew past this are freed instead of recycled.
const MAX_RETAINED_CAPACITY: usize = 1 << 20;

/// Global buffer pool used when [`Opts::buffer_pool`](crate::Opts) is left at its default.
pub static GLOBAL_BUFFER_POOL: LazyLock<Arc<BufferPool>> =
    LazyLock::new(|| Arc::new(BufferPool::default()));

/// A pooled byte buffer that returns itself to the pool on drop.
pub struct PooledBuf {
    pool: Arc<BufferPool>,
    inner: Vec<u8>,
}

impl PooledBuf {
    /// Take the bytes out, leaving this buffer empty.
    ///
    /// The returned vector is not recycled.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.inner)
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.inner.len())
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.inner);
        self.pool.release(buf);
    }
}

/// Pool of byte buffers reused across connections.
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
}

impl BufferPool {
    /// Create a new buffer pool holding at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Get a buffer from the pool, or allocate a new one if the pool is empty.
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let inner = self
            .buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(INITIAL_BUFFER_CAPACITY));
        PooledBuf {
            pool: Arc::clone(self),
            inner,
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.buffers.len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() == 0 || buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        // Ignore if pool is full
        let _ = self.buffers.push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_is_recycled_cleared() {
        let pool = Arc::new(BufferPool::new(4));
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"hello");
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 5);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_oversized_buffer_is_freed() {
        let pool = Arc::new(BufferPool::new(4));
        {
            let mut buf = pool.acquire();
            buf.reserve(MAX_RETAINED_CAPACITY + 1);
        }
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_into_vec_is_not_recycled() {
        let pool = Arc::new(BufferPool::new(4));
        let mut buf = pool.acquire();
        buf.push(1);
        let bytes = buf.into_vec();
        assert_eq!(bytes, vec![1]);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(BufferPool::new(8));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for i in 0..100u8 {
                        let mut buf = pool.acquire();
                        buf.push(i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.idle() <= 8);
    }
}
