//! Single-producer/single-consumer ring buffer (spec §3.3, §4.G).
//!
//! Classic mod-size wraparound buffer: `capacity` slots are carved as one
//! contiguous allocation, but only `capacity - 1` are ever usable at once —
//! the gap is what lets `head == tail` mean empty and `head == tail - 1`
//! (mod capacity) mean full without a separate counter that the producer
//! and consumer would otherwise have to share. Producer and consumer
//! indices live in their own cache lines since exactly one thread on each
//! side writes its own index and only reads the other's.

use crate::arena::Arena;
use crate::contract::{Metadata, Payload};
use crate::error::{ArenaError, ArenaResult};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A fixed-capacity single-producer/single-consumer queue.
///
/// `capacity` must be at least 2; only `capacity - 1` elements can be held
/// at once (spec §4.G).
pub struct Spsc {
    _arena: Arc<Arena>,
    buffer: *mut UnsafeCell<Payload>,
    capacity: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

impl Spsc {
    /// # Panics
    /// Panics if `capacity < 2` or the arena cannot supply the backing
    /// buffer.
    #[must_use]
    pub fn new(arena: Arc<Arena>, capacity: usize) -> Self {
        assert!(capacity >= 2, "spsc capacity must hold at least one usable slot");
        let bytes = capacity
            .checked_mul(size_of::<UnsafeCell<Payload>>())
            .expect("spsc capacity overflowed byte count");
        let raw = arena
            .alloc(bytes)
            .expect("arena must have room for the spsc buffer");
        let buffer = raw.as_ptr().cast::<UnsafeCell<Payload>>();
        // SAFETY: `raw` is a freshly carved, exclusively-owned allocation of
        // `capacity` `UnsafeCell<Payload>` slots, suitably aligned (arena
        // rounds to 8; `Payload`'s alignment is 8).
        unsafe {
            for i in 0..capacity {
                buffer.add(i).write(UnsafeCell::new(Payload::default()));
            }
        }
        Self {
            _arena: arena,
            buffer,
            capacity,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity - 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        let next = (tail + 1) % self.capacity;
        next == self.head.load(Ordering::Acquire)
    }

    /// Approximate element count; exact only when called by the producer
    /// (for a lower bound) or the consumer (for an upper bound) on itself,
    /// per the relaxed-counter discipline described in spec §9.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + self.capacity - head) % self.capacity
    }

    /// Producer-only: pushes one element, or reports the ring full
    /// (spec §4.G).
    pub fn insert(&self, key: u64, value: u64) -> ArenaResult<()> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % self.capacity;
        if next == self.head.load(Ordering::Acquire) {
            return Err(ArenaError::Full);
        }
        // SAFETY: only the producer ever writes slot `tail`; the consumer
        // cannot observe this slot until `tail` is published below.
        unsafe { *(*self.buffer.add(tail)).get() = Payload::new(key, value) };
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer-only: pops the oldest element, or reports the ring empty.
    pub fn delete(&self) -> ArenaResult<Payload> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return Err(ArenaError::NotFound);
        }
        // SAFETY: slot `head` was published by the producer's `Release`
        // store to `tail` above; only the consumer reads or advances `head`.
        let payload = unsafe { *(*self.buffer.add(head)).get() };
        self.head.store((head + 1) % self.capacity, Ordering::Release);
        Ok(payload)
    }

    /// Convenience wrapper equivalent to [`Spsc::delete`] (spec §4.B `pop`).
    pub fn pop(&self) -> ArenaResult<Payload> {
        self.delete()
    }

    /// Integrity check (spec §4.G): both indices in range and the element
    /// count within the usable capacity.
    pub fn verify(&self) -> ArenaResult<()> {
        if self.buffer.is_null() {
            return Err(ArenaError::Corrupt);
        }
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= self.capacity || tail >= self.capacity || self.len() > self.capacity() {
            return Err(ArenaError::Corrupt);
        }
        Ok(())
    }

    #[must_use]
    pub fn get_metadata() -> Metadata {
        Metadata {
            name: "spsc",
            description: "single-producer/single-consumer ring buffer",
            node_size: size_of::<Payload>(),
            requires_locking: false,
        }
    }
}

// SAFETY: the buffer is shared between exactly one producer and one
// consumer thread, each of which only ever touches the slots the protocol
// above hands it exclusive access to.
unsafe impl Send for Spsc {}
unsafe impl Sync for Spsc {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn new_spsc(capacity: usize) -> Spsc {
        Spsc::new(Arc::new(Arena::new(16, crate::arena::DEFAULT_PAGE_SIZE)), capacity)
    }

    #[test]
    fn empty_then_full_then_empty() {
        let ring = new_spsc(4);
        assert!(ring.is_empty());
        for i in 0..3 {
            ring.insert(i, i).unwrap();
        }
        assert!(ring.is_full());
        assert_eq!(ring.insert(99, 99), Err(ArenaError::Full));
        for i in 0..3 {
            assert_eq!(ring.delete().unwrap(), Payload::new(i, i));
        }
        assert!(ring.is_empty());
        assert_eq!(ring.delete(), Err(ArenaError::NotFound));
    }

    #[test]
    fn wraparound_preserves_order() {
        let ring = new_spsc(4);
        for i in 0..3 {
            ring.insert(i, i).unwrap();
        }
        ring.delete().unwrap();
        ring.delete().unwrap();
        ring.insert(10, 10).unwrap();
        ring.insert(11, 11).unwrap();
        assert_eq!(ring.delete().unwrap(), Payload::new(2, 2));
        assert_eq!(ring.delete().unwrap(), Payload::new(10, 10));
        assert_eq!(ring.delete().unwrap(), Payload::new(11, 11));
        assert!(ring.is_empty());
    }

    #[test]
    fn concurrent_producer_consumer_preserve_fifo_order() {
        let ring = Arc::new(new_spsc(64));
        const COUNT: u64 = 50_000;

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..COUNT {
                    while ring.insert(i, i).is_err() {
                        std::thread::yield_now();
                    }
                }
            })
        };
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut next = 0u64;
                while next < COUNT {
                    match ring.delete() {
                        Ok(payload) => {
                            assert_eq!(payload.key, next);
                            next += 1;
                        }
                        Err(ArenaError::NotFound) => std::thread::yield_now(),
                        Err(_) => unreachable!(),
                    }
                }
            })
        };
        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
