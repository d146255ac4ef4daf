//! Vyukov bounded multi-producer/multi-consumer ring (spec §3.3, §4.E).
//!
//! Every cell carries its own `sequence` number instead of relying on a pair
//! of shared head/tail counters to agree on ownership. A thread claims a
//! slot by winning a CAS on the shared position counter, then uses the
//! cell's sequence to know when the slot is actually ready to read or
//! write — this is what lets multiple producers (and multiple consumers)
//! operate without a global lock.

use crate::arena::Arena;
use crate::contract::{Metadata, Payload};
use crate::error::{ArenaError, ArenaResult};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Cell {
    sequence: AtomicUsize,
    payload: UnsafeCell<Payload>,
}

/// A fixed-capacity multi-producer/multi-consumer queue. `capacity` must be
/// a power of two, at least 2 (spec §4.E).
pub struct Mpmc {
    _arena: Arc<Arena>,
    buffer: *mut Cell,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

impl Mpmc {
    /// # Panics
    /// Panics if `capacity` is not a power of two, is less than 2, or the
    /// arena cannot supply the backing buffer.
    #[must_use]
    pub fn new(arena: Arc<Arena>, capacity: usize) -> Self {
        assert!(capacity >= 2, "mpmc capacity must be at least 2");
        assert!(capacity.is_power_of_two(), "mpmc capacity must be a power of two");

        let bytes = capacity
            .checked_mul(size_of::<Cell>())
            .expect("mpmc capacity overflowed byte count");
        let raw = arena
            .alloc(bytes)
            .expect("arena must have room for the mpmc buffer");
        let buffer = raw.as_ptr().cast::<Cell>();
        // SAFETY: `raw` is a freshly carved, exclusively-owned allocation of
        // `capacity` `Cell`s, suitably aligned (arena rounds to 8, `Cell`'s
        // alignment is 8).
        unsafe {
            for i in 0..capacity {
                buffer.add(i).write(Cell {
                    sequence: AtomicUsize::new(i),
                    payload: UnsafeCell::new(Payload::default()),
                });
            }
        }

        Self {
            _arena: arena,
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Approximate element count (spec §9: relaxed, not linearized).
    #[must_use]
    pub fn len(&self) -> usize {
        let enqueue = self.enqueue_pos.load(Ordering::Relaxed);
        let dequeue = self.dequeue_pos.load(Ordering::Relaxed);
        enqueue.wrapping_sub(dequeue)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn cell(&self, pos: usize) -> &Cell {
        // SAFETY: `pos & mask` is always in `0..capacity`, within the
        // allocation carved in `new`.
        unsafe { &*self.buffer.add(pos & self.mask) }
    }

    /// Claims a slot and writes `(key, value)` into it, or reports the ring
    /// full (spec §4.E).
    pub fn insert(&self, key: u64, value: u64) -> ArenaResult<()> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = self.cell(pos);
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS grants exclusive access to
                        // this cell's payload until the sequence store below
                        // publishes it to a consumer.
                        unsafe { *cell.payload.get() = Payload::new(key, value) };
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return Err(ArenaError::Full);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Claims a ready slot and returns its payload, or reports the ring
    /// empty.
    pub fn delete(&self) -> ArenaResult<Payload> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = self.cell(pos);
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS grants exclusive access to
                        // this cell's payload; the producer cannot reuse the
                        // slot until the sequence store below completes.
                        let payload = unsafe { *cell.payload.get() };
                        cell.sequence
                            .store(pos.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
                        return Ok(payload);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return Err(ArenaError::NotFound);
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Convenience wrapper equivalent to [`Mpmc::delete`] (spec §4.B `pop`).
    pub fn pop(&self) -> ArenaResult<Payload> {
        self.delete()
    }

    /// Snapshot scan from the current dequeue position forward (spec §6
    /// `S_iterate`); not linearized against concurrent producers/consumers.
    pub fn iterate(&self, mut callback: impl FnMut(Payload)) -> usize {
        let dequeue = self.dequeue_pos.load(Ordering::Relaxed);
        let enqueue = self.enqueue_pos.load(Ordering::Relaxed);
        let mut visited = 0;
        let mut pos = dequeue;
        while pos != enqueue && visited < self.capacity() {
            let cell = self.cell(pos);
            // SAFETY: a snapshot read; may race with a concurrent producer
            // or consumer claiming this cell, in which case the payload
            // observed is stale or in-flight rather than wrong memory.
            let payload = unsafe { *cell.payload.get() };
            callback(payload);
            visited += 1;
            pos = pos.wrapping_add(1);
        }
        visited
    }

    /// Integrity check (spec §4.E): `dequeue_pos <= enqueue_pos`, the
    /// in-flight count never exceeds capacity, and the buffer is non-null.
    pub fn verify(&self) -> ArenaResult<()> {
        if self.buffer.is_null() {
            return Err(ArenaError::Corrupt);
        }
        let enqueue = self.enqueue_pos.load(Ordering::Acquire);
        let dequeue = self.dequeue_pos.load(Ordering::Acquire);
        if enqueue.wrapping_sub(dequeue) > self.capacity() {
            return Err(ArenaError::Corrupt);
        }
        Ok(())
    }

    #[must_use]
    pub fn get_metadata() -> Metadata {
        Metadata {
            name: "mpmc",
            description: "Vyukov bounded multi-producer/multi-consumer ring",
            node_size: size_of::<Cell>(),
            requires_locking: false,
        }
    }
}

// SAFETY: all cell access is gated by winning a CAS on the relevant position
// counter, so at most one thread ever has access to a given cell's payload
// between the claim and the matching sequence-number publish.
unsafe impl Send for Mpmc {}
unsafe impl Sync for Mpmc {}
