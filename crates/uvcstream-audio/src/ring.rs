//! Lock-free single-producer single-consumer byte ring.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// How long a short read waits for more data, in 1 ms slices.
const READ_WAIT_SLICES: u32 = 50;

/// SPSC byte ring for PCM data.
///
/// `head` is written only by the producer (pump thread), `tail` only by the
/// consumer (reader thread). One slot stays unused so a full ring is
/// distinguishable from an empty one: `available + free + 1 == capacity`.
///
/// The buffer itself needs no lock: the producer only writes bytes the
/// consumer cannot be reading (beyond `head`, before `tail - 1`), and index
/// updates publish with release stores after the copy.
pub struct AudioRing {
    buffer: UnsafeCell<Box<[u8]>>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    overflows: AtomicU64,
}

// Producer and consumer touch disjoint regions, coordinated by head/tail.
unsafe impl Sync for AudioRing {}

impl AudioRing {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        Self {
            buffer: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Bytes ready for the consumer.
    pub fn available(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & self.mask
    }

    /// Bytes the producer may still write.
    pub fn free(&self) -> usize {
        self.capacity() - self.available() - 1
    }

    /// Packets dropped because the ring had no room.
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Producer side: copies `data` in whole or not at all. Returns false
    /// (and counts an overflow) when free space is insufficient.
    pub fn write(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let free = self.capacity() - (head.wrapping_sub(tail) & self.mask) - 1;
        if free < data.len() {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let capacity = self.capacity();
        let first = (capacity - head).min(data.len());
        // Safety: SPSC discipline. Only this thread writes bytes in
        // [head, head + len), and the consumer will not read them until the
        // release store below makes them visible.
        unsafe {
            let buffer = (*self.buffer.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(data.as_ptr(), buffer.add(head), first);
            if first < data.len() {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first),
                    buffer,
                    data.len() - first,
                );
            }
        }
        self.head
            .store((head + data.len()) & self.mask, Ordering::Release);
        true
    }

    /// Consumer side: copies up to `out.len()` bytes and returns the count.
    /// If less than a full `out` is available, waits in 1 ms slices for up
    /// to 50 ms before settling for what is there.
    pub fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }

        let mut available = self.available();
        let mut waits = READ_WAIT_SLICES;
        while available < out.len() && waits > 0 {
            thread::sleep(Duration::from_millis(1));
            available = self.available();
            waits -= 1;
        }
        if available == 0 {
            return 0;
        }

        let to_read = available.min(out.len());
        let tail = self.tail.load(Ordering::Relaxed);
        let capacity = self.capacity();
        let first = (capacity - tail).min(to_read);
        // Safety: SPSC discipline, mirror of write().
        unsafe {
            let buffer = (*self.buffer.get()).as_ptr();
            std::ptr::copy_nonoverlapping(buffer.add(tail), out.as_mut_ptr(), first);
            if first < to_read {
                std::ptr::copy_nonoverlapping(
                    buffer,
                    out.as_mut_ptr().add(first),
                    to_read - first,
                );
            }
        }
        self.tail
            .store((tail + to_read) & self.mask, Ordering::Release);
        to_read
    }
}
