//! Loom-based exhaustive interleaving tests for the two structures in this
//! crate whose helping protocols most need it: the Michael-Scott queue
//! (spec §4.D) and the Vyukhov bounded MPMC ring (spec §4.E).
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! The production structures in `src/` allocate their nodes out of the
//! arena and use plain `std::sync::atomic`; loom requires its own atomic
//! types to explore interleavings, so these tests model each protocol's
//! synchronization core in isolation with `loom`'s atomics and a
//! `Box`-backed node instead of the arena. This mirrors the production
//! code's CAS/ordering choices exactly; only the allocation source differs.

#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;
use std::ptr;

/// Michael-Scott queue node (spec §3.3, §4.D): `next` is the only field the
/// synchronization protocol touches, so the model carries just a payload
/// tag instead of the full `(key, value)` pair.
struct Node {
    next: AtomicPtr<Node>,
    value: usize,
}

struct LoomMsQueue {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
}

impl LoomMsQueue {
    fn new() -> Self {
        let dummy = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: 0,
        }));
        Self {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
        }
    }

    /// Spec §4.D "Enqueue": attach via release-CAS on the tail's `next`,
    /// then help-swing tail; a failed swing is left for the next operation.
    fn enqueue(&self, value: usize) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }));
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: `tail` is always a live node; nodes are never freed in
            // this model (loom's exhaustive search does not need reclamation
            // to expose ordering bugs).
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if !next.is_null() {
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }
            // SAFETY: `tail` observed above is still live.
            let cas = unsafe {
                (*tail).next.compare_exchange(
                    ptr::null_mut(),
                    node,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
            };
            if cas.is_ok() {
                let _ =
                    self.tail
                        .compare_exchange(tail, node, Ordering::Release, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Spec §4.D "Dequeue": helps a lagging tail, otherwise swings head
    /// acquire-ordered past the dummy.
    fn dequeue(&self) -> Option<usize> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: `head` observed above is still live.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                return None;
            }
            if head == tail {
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }
            // SAFETY: `next` was published by a completed enqueue.
            let value = unsafe { (*next).value };
            if self
                .head
                .compare_exchange(head, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(value);
            }
        }
    }
}

unsafe impl Send for LoomMsQueue {}
unsafe impl Sync for LoomMsQueue {}

/// Spec §8 scenario 2 ("MS queue tail-help"): two concurrent producers race
/// the tail-swing helping protocol; loom explores every interleaving and the
/// test asserts both elements are eventually observed exactly once.
#[test]
fn loom_msqueue_two_producers_help_tail() {
    loom::model(|| {
        let queue = Arc::new(LoomMsQueue::new());
        let q1 = Arc::clone(&queue);
        let q2 = Arc::clone(&queue);

        let t1 = thread::spawn(move || q1.enqueue(1));
        let t2 = thread::spawn(move || q2.enqueue(2));
        t1.join().unwrap();
        t2.join().unwrap();

        let mut seen = vec![queue.dequeue(), queue.dequeue()];
        seen.sort_unstable();
        assert_eq!(seen, vec![Some(1), Some(2)]);
        assert_eq!(queue.dequeue(), None);
    });
}

/// Spec §8 invariant 1 for queues: a single producer's enqueue order is
/// observed by a concurrent dequeuer that starts racing immediately.
#[test]
fn loom_msqueue_concurrent_enqueue_dequeue_preserves_fifo() {
    loom::model(|| {
        let queue = Arc::new(LoomMsQueue::new());
        let producer_queue = Arc::clone(&queue);

        let producer = thread::spawn(move || {
            producer_queue.enqueue(10);
            producer_queue.enqueue(20);
        });

        let mut received = Vec::new();
        for _ in 0..6 {
            if let Some(v) = queue.dequeue() {
                received.push(v);
            }
        }
        producer.join().unwrap();
        while received.len() < 2 {
            if let Some(v) = queue.dequeue() {
                received.push(v);
            }
        }

        assert_eq!(received, vec![10, 20]);
    });
}

/// Vyukhov bounded MPMC cell (spec §3.3, §4.E): `sequence` is the whole
/// coordination protocol, so the model needs nothing else.
struct Cell {
    sequence: AtomicUsize,
    value: AtomicUsize,
}

struct LoomMpmc {
    buffer: Vec<Cell>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

impl LoomMpmc {
    fn new(capacity: usize) -> Self {
        let buffer = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: AtomicUsize::new(0),
            })
            .collect();
        Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    /// Spec §4.E "Enqueue": claim a slot via relaxed CAS on the position
    /// counter once its cell's sequence matches, then publish with a
    /// release store.
    fn enqueue(&self, value: usize) -> bool {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                if self
                    .enqueue_pos
                    .compare_exchange(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    cell.value.store(value, Ordering::Relaxed);
                    cell.sequence.store(pos + 1, Ordering::Release);
                    return true;
                }
            } else if diff < 0 {
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
                continue;
            }
            pos = self.enqueue_pos.load(Ordering::Relaxed);
        }
    }

    /// Spec §4.E "Dequeue": symmetric readiness condition on `dequeue_pos`.
    fn dequeue(&self) -> Option<usize> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;
            if diff == 0 {
                if self
                    .dequeue_pos
                    .compare_exchange(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = cell.value.load(Ordering::Relaxed);
                    cell.sequence.store(pos + self.mask + 1, Ordering::Release);
                    return Some(value);
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
                continue;
            }
            pos = self.dequeue_pos.load(Ordering::Relaxed);
        }
    }
}

unsafe impl Send for LoomMpmc {}
unsafe impl Sync for LoomMpmc {}

/// Spec §8 scenario 3 ("Vyukhov MPMC wrap"): two producers and two
/// consumers race a capacity-2 ring; every enqueued value is dequeued
/// exactly once, regardless of interleaving.
#[test]
fn loom_mpmc_two_producers_two_consumers() {
    loom::model(|| {
        let ring = Arc::new(LoomMpmc::new(2));
        let p1 = Arc::clone(&ring);
        let p2 = Arc::clone(&ring);
        let c1 = Arc::clone(&ring);
        let c2 = Arc::clone(&ring);

        let t1 = thread::spawn(move || p1.enqueue(1));
        let t2 = thread::spawn(move || p2.enqueue(2));
        assert!(t1.join().unwrap());
        assert!(t2.join().unwrap());

        let r1 = thread::spawn(move || c1.dequeue());
        let r2 = thread::spawn(move || c2.dequeue());
        let mut results = vec![r1.join().unwrap(), r2.join().unwrap()];
        results.sort_unstable();
        assert_eq!(results, vec![Some(1), Some(2)]);
        assert_eq!(ring.dequeue(), None);
    });
}

/// Spec §4.E invariant: `diff < 0` on enqueue means full; a ring at
/// capacity never accepts a third element no matter which producer runs
/// first.
#[test]
fn loom_mpmc_rejects_when_full() {
    loom::model(|| {
        let ring = Arc::new(LoomMpmc::new(2));
        assert!(ring.enqueue(1));
        assert!(ring.enqueue(2));
        assert!(!ring.enqueue(3));
        assert_eq!(ring.dequeue(), Some(1));
        assert!(ring.enqueue(3));
    });
}
