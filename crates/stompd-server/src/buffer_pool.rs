//! Bounded free list of fixed-size read buffers.
//!
//! Connections lease a buffer per read and hand it back when the lease is
//! dropped, once the chunk has been decoded, so steady-state reads do not
//! allocate. The free list keeps at most `capacity` buffers; surplus
//! returns are freed.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

/// Pool of reusable byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    capacity: usize,
    allocations: AtomicUsize,
}

impl BufferPool {
    /// Create an empty pool of `buffer_size` buffers retaining at most
    /// `capacity` idle buffers.
    pub fn new(buffer_size: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            buffer_size,
            capacity,
            allocations: AtomicUsize::new(0),
        })
    }

    /// Lease a buffer, reusing an idle one when available.
    pub fn lease(self: &Arc<Self>) -> LeasedBuffer {
        let buffer = self.free.lock().pop().unwrap_or_else(|| {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0; self.buffer_size]
        });

        LeasedBuffer { buffer: Some(buffer), pool: Arc::clone(self) }
    }

    /// Size of every buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Idle buffers currently retained.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Buffers allocated over the pool's lifetime.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    fn release(&self, buffer: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buffer);
        }
    }
}

/// A leased buffer. Returned to its pool exactly once, on drop.
#[derive(Debug)]
pub struct LeasedBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for LeasedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or_default()
    }
}

impl DerefMut for LeasedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for LeasedBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}
