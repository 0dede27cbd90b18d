//! Reusable scratch buffers for the send path.
//!
//! Every send needs a plaintext buffer and a sealed frame buffer for a few
//! microseconds. [`BufferPool`] keeps a bounded stack of cleared `Vec<u8>`s;
//! a [`PooledBuffer`] guard hands one out and puts it back on drop. Buffers
//! that grew past the retention cap are dropped instead of pooled.
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
    initial_capacity: usize,
    max_retained_capacity: usize,
}

/// Shared, bounded pool of byte buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool retaining at most `max_pooled` buffers. New buffers start
    /// with `initial_capacity`; buffers above four times that are not retained.
    pub fn new(max_pooled: usize, initial_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(max_pooled)),
                max_pooled,
                initial_capacity,
                max_retained_capacity: initial_capacity.saturating_mul(4).max(64),
            }),
        }
    }

    /// Takes a cleared buffer from the pool, allocating if none is free.
    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.initial_capacity));
        PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of buffers currently waiting for reuse.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        if buf.capacity() > self.pool.max_retained_capacity {
            return;
        }
        buf.clear();
        let mut free = self.pool.free.lock();
        if free.len() < self.pool.max_pooled {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_returned_cleared() {
        let pool = BufferPool::new(2, 128);
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"secret plaintext");
        }
        assert_eq!(pool.available(), 1);
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 128);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = BufferPool::new(2, 16);
        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(held);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn oversized_buffers_are_not_retained() {
        let pool = BufferPool::new(2, 16);
        {
            let mut buf = pool.acquire();
            buf.resize(4096, 0);
        }
        assert_eq!(pool.available(), 0);
    }
}
