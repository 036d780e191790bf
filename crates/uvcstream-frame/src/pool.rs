//! LIFO frame buffer pool.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::FrameBuffer;

/// Pool hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
}

impl PoolStats {
    pub fn reuse_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f32 / total as f32
    }
}

/// Recycles frame buffers to avoid per-frame heap churn. Last-released is
/// first-acquired so the warmest allocation gets reused.
#[derive(Debug)]
pub struct FramePool {
    free: Mutex<Vec<FrameBuffer>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A recycled buffer when one is free, a fresh allocation otherwise.
    /// Either way the buffer comes back empty with a fresh timestamp.
    pub fn acquire(&self) -> FrameBuffer {
        if let Some(mut frame) = self.free.lock().pop() {
            frame.reset();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return frame;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        FrameBuffer::new()
    }

    /// Returns a buffer to the free list; drops the allocation when the pool
    /// is already at capacity.
    pub fn release(&self, frame: FrameBuffer) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(frame);
        } else {
            debug!(capacity = self.capacity, "pool full, dropping buffer");
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
