//! Scratch buffer pool
//!
//! Extent reads and record reassembly need large scratch buffers on every
//! query. Buffers are checked out as [`PooledBuffer`] guards and go back to
//! the pool when the guard drops, so no two callers ever share one.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

struct Shared {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_idle: usize,
}

/// Fixed-size byte buffers handed out on demand
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    /// Pool of `buffer_size`-byte buffers keeping at most `max_idle` free ones
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::with_capacity(max_idle)),
                buffer_size,
                max_idle,
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Take a zeroed buffer
    pub fn checkout(&self) -> PooledBuffer {
        let reused = self
            .shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buf = match reused {
            Some(mut buf) => {
                buf.fill(0);
                buf
            }
            None => vec![0u8; self.shared.buffer_size],
        };
        PooledBuffer {
            buf: Some(buf),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Free buffers currently held
    pub fn idle(&self) -> usize {
        self.shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A checked-out buffer; returned to its pool on drop
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    shared: Arc<Shared>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut free = self.shared.free.lock().unwrap_or_else(PoisonError::into_inner);
            if free.len() < self.shared.max_idle && buf.len() == self.shared.buffer_size {
                free.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_returns_on_drop() {
        let pool = BufferPool::new(1024, 2);
        {
            let mut a = pool.checkout();
            a[0] = 7;
            let _b = pool.checkout();
            let _c = pool.checkout();
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 2);

        let again = pool.checkout();
        assert_eq!(again.len(), 1024);
        assert!(again.iter().all(|&b| b == 0));
    }
}
