//! Reusable frame buffers.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// Capacity of a freshly allocated buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Buffers that grew beyond this are dropped instead of pooled.
pub const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

const MAX_IDLE_BUFFERS: usize = 8;

/// Pool of byte buffers used to assemble outgoing frames.
#[derive(Debug, Default)]
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared buffer from the pool.
    ///
    /// The buffer goes back to the pool when the guard is dropped.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(DEFAULT_BUFFER_CAPACITY));

        PooledBuffer { buf, pool: self }
    }

    /// Number of buffers waiting for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();

        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_BUFFERS {
            idle.push(buf);
        }
    }
}

/// Buffer borrowed from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
