//! Michael–Scott lock-free FIFO queue (spec §3.3, §4.D).
//!
//! `head` always points at a dummy node; the first real element, if any, is
//! `head->next`. Every producer and consumer is lock-free with helping: a
//! thread that observes a lagging `tail` advances it on the struggling
//! thread's behalf before retrying its own operation (spec §8 scenario 2).

use crate::arena::Arena;
use crate::backoff::Backoff;
use crate::contract::{Metadata, Payload};
use crate::error::{ArenaError, ArenaResult};
use crate::metrics::Metrics;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bounded retry budget for both enqueue and dequeue (spec §4.D: "~10").
const RETRY_BUDGET: usize = 10;

/// `verify` tolerates this much drift between the traversed count and the
/// stored (relaxed) count, since a concurrent mutation can shift either
/// figure mid-walk. Spec §9 open question (a): we resolve it by making the
/// tolerance explicit and small rather than the original's loose ~100.
const COUNT_TOLERANCE: usize = 8;

/// Bounded traversal guard against a corrupted or cyclic chain.
const MAX_TRAVERSAL: usize = 10_000_000;

#[repr(C)]
struct Node {
    next: AtomicPtr<Node>,
    key: u64,
    value: u64,
}

/// A lock-free multi-producer multi-consumer FIFO queue.
pub struct MsQueue {
    arena: Arc<Arena>,
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
    count: AtomicUsize,
    metrics: Metrics,
}

impl MsQueue {
    /// Allocates the dummy node and initializes `head`/`tail` to it
    /// (spec §4.B `init`).
    ///
    /// # Panics
    /// Panics if the arena cannot supply the dummy node.
    #[must_use]
    pub fn new(arena: Arc<Arena>) -> Self {
        let raw = arena
            .alloc(size_of::<Node>())
            .expect("arena must have room for the dummy node");
        let dummy = raw.as_ptr().cast::<Node>();
        // SAFETY: `raw` is a freshly carved, exclusively-owned allocation.
        unsafe {
            dummy.write(Node {
                next: AtomicPtr::new(std::ptr::null_mut()),
                key: 0,
                value: 0,
            });
        }
        Self {
            arena,
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            count: AtomicUsize::new(0),
            metrics: Metrics::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        // SAFETY: head always points at a live node (the dummy, or a
        // formerly-real node that became the new dummy after a dequeue).
        let head = self.head.load(Ordering::Acquire);
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }

    /// Enqueues `(key, value)` (spec §4.D "Enqueue").
    pub fn insert(&self, key: u64, value: u64) -> ArenaResult<()> {
        let raw = self
            .arena
            .alloc(size_of::<Node>())
            .ok_or(ArenaError::OutOfMemory)?;
        let node = raw.as_ptr().cast::<Node>();
        // SAFETY: freshly carved, exclusively-owned allocation.
        unsafe {
            node.write(Node {
                next: AtomicPtr::new(std::ptr::null_mut()),
                key,
                value,
            });
        }

        let mut backoff = Backoff::new();
        for _ in 0..RETRY_BUDGET {
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: tail always points at a live node owned by this queue.
            let tail_next = unsafe { (*tail).next.load(Ordering::Acquire) };

            if !tail_next.is_null() {
                // tail lagged behind the real last node; help it catch up.
                let _ = self.tail.compare_exchange(
                    tail,
                    tail_next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                self.metrics.add_helped();
                backoff.spin();
                continue;
            }

            // SAFETY: see above.
            let link = unsafe { &(*tail).next };
            if link
                .compare_exchange(std::ptr::null_mut(), node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                // Best-effort tail swing; a lagging tail is helped by the
                // next operation regardless of whether this CAS succeeds.
                let _ = self.tail.compare_exchange(tail, node, Ordering::Release, Ordering::Relaxed);
                self.count.fetch_add(1, Ordering::Relaxed);
                self.metrics.add_insert();
                return Ok(());
            }
            self.metrics.add_retry();
            backoff.spin();
        }

        // SAFETY: `node` was just allocated above and never linked in.
        unsafe { self.arena.free(NonNull::new_unchecked(node.cast())) };
        Err(ArenaError::Invalid)
    }

    /// Dequeues the oldest element, or reports the queue empty
    /// (spec §4.D "Dequeue"). The `key` parameter of the uniform contract
    /// is ignored for queue-like structures.
    pub fn delete(&self) -> ArenaResult<Payload> {
        let mut backoff = Backoff::new();
        for _ in 0..RETRY_BUDGET {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: head always points at a live node.
            let head_next = unsafe { (*head).next.load(Ordering::Acquire) };

            if self.head.load(Ordering::Relaxed) != head {
                // head moved under us; restart.
                self.metrics.add_retry();
                backoff.spin();
                continue;
            }

            if head_next.is_null() {
                return Err(ArenaError::NotFound);
            }

            if head == tail {
                // tail lagged; help it catch up and retry.
                let _ = self.tail.compare_exchange(
                    tail,
                    head_next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                self.metrics.add_helped();
                backoff.spin();
                continue;
            }

            // SAFETY: head_next is non-null and owned by this queue.
            let payload = unsafe { Payload::new((*head_next).key, (*head_next).value) };

            if self
                .head
                .compare_exchange(head, head_next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: `head` (the old dummy) is now unreachable from the
                // queue and was allocated from this arena.
                unsafe { self.arena.free(NonNull::new_unchecked(head.cast())) };
                self.count.fetch_sub(1, Ordering::Relaxed);
                self.metrics.add_delete();
                return Ok(payload);
            }
            self.metrics.add_retry();
            backoff.spin();
        }
        Err(ArenaError::Invalid)
    }

    /// Convenience wrapper equivalent to [`MsQueue::delete`] (spec §4.B
    /// `pop`); queues have no separate pop algorithm.
    pub fn pop(&self) -> ArenaResult<Payload> {
        self.delete()
    }

    /// Linear snapshot scan for `key` (spec §4.D). Consistent only at the
    /// instant of observation.
    #[must_use]
    pub fn search(&self, key: u64) -> Option<Payload> {
        let mut cursor = self.head.load(Ordering::Acquire);
        let mut steps = 0;
        loop {
            if steps >= MAX_TRAVERSAL {
                return None;
            }
            // SAFETY: cursor is always a live node owned by this queue.
            let next = unsafe { (*cursor).next.load(Ordering::Acquire) };
            let Some(next_node) = NonNull::new(next) else {
                return None;
            };
            // SAFETY: see above.
            let node = unsafe { next_node.as_ref() };
            if node.key == key {
                return Some(Payload::new(node.key, node.value));
            }
            cursor = next;
            steps += 1;
        }
    }

    /// Visits every real (non-dummy) element from `head` to the observed
    /// `tail`, returning the number visited (spec §6 `S_iterate`).
    pub fn iterate(&self, mut callback: impl FnMut(Payload)) -> usize {
        let mut cursor = self.head.load(Ordering::Acquire);
        let mut visited = 0;
        while visited < MAX_TRAVERSAL {
            // SAFETY: cursor is always a live node owned by this queue.
            let next = unsafe { (*cursor).next.load(Ordering::Acquire) };
            let Some(next_node) = NonNull::new(next) else {
                break;
            };
            // SAFETY: see above.
            let node = unsafe { next_node.as_ref() };
            callback(Payload::new(node.key, node.value));
            cursor = next;
            visited += 1;
        }
        visited
    }

    /// Read-only integrity check (spec §4.D, §9 open question (a)): walks
    /// from `head` to the observed `tail`, bounded, and tolerates a small
    /// drift between the traversed count and the stored approximate count.
    pub fn verify(&self) -> ArenaResult<()> {
        let tail = self.tail.load(Ordering::Acquire);
        let mut cursor = self.head.load(Ordering::Acquire);
        let mut visited = 0;

        while cursor != tail {
            if visited >= MAX_TRAVERSAL {
                return Err(ArenaError::Corrupt);
            }
            // SAFETY: cursor is always a live node owned by this queue.
            let next = unsafe { (*cursor).next.load(Ordering::Acquire) };
            if next.is_null() {
                // tail lagged behind what we can reach; not a corruption.
                break;
            }
            cursor = next;
            visited += 1;
        }

        let stored = self.len();
        if visited.abs_diff(stored) > COUNT_TOLERANCE {
            return Err(ArenaError::Corrupt);
        }
        Ok(())
    }

    #[must_use]
    pub fn get_metadata() -> Metadata {
        Metadata {
            name: "msqueue",
            description: "Michael-Scott lock-free MPMC FIFO queue",
            node_size: size_of::<Node>(),
            requires_locking: false,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.metrics.snapshot()
    }
}

// SAFETY: all shared state is accessed exclusively through atomics with the
// orderings documented above.
unsafe impl Send for MsQueue {}
unsafe impl Sync for MsQueue {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn new_queue() -> MsQueue {
        MsQueue::new(Arc::new(Arena::new(64, crate::arena::DEFAULT_PAGE_SIZE)))
    }

    #[test]
    fn fifo_single_threaded() {
        let q = new_queue();
        for i in 0..10 {
            q.insert(i, i * 10).unwrap();
        }
        assert!(q.verify().is_ok());
        for i in 0..10 {
            assert_eq!(q.delete().unwrap(), Payload::new(i, i * 10));
        }
        assert_eq!(q.delete(), Err(ArenaError::NotFound));
    }

    #[test]
    fn empty_queue_reports_not_found() {
        let q = new_queue();
        assert_eq!(q.delete(), Err(ArenaError::NotFound));
        assert!(q.is_empty());
    }

    #[test]
    fn search_finds_enqueued_key() {
        let q = new_queue();
        q.insert(7, 70).unwrap();
        q.insert(8, 80).unwrap();
        assert_eq!(q.search(8), Some(Payload::new(8, 80)));
        assert_eq!(q.search(99), None);
    }

    #[test]
    fn concurrent_mpmc_delivers_every_element_exactly_once() {
        let q = Arc::new(new_queue());
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 1000;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let key = p * PER_PRODUCER + i;
                        while q.insert(key, key).is_err() {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let total = PRODUCERS * PER_PRODUCER;
        let seen = Arc::new(std::sync::Mutex::new(Vec::with_capacity(total as usize)));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                let seen = Arc::clone(&seen);
                thread::spawn(move || loop {
                    match q.delete() {
                        Ok(payload) => seen.lock().unwrap().push(payload.key),
                        Err(ArenaError::NotFound) => {
                            if seen.lock().unwrap().len() as u64 >= total {
                                break;
                            }
                            std::thread::yield_now();
                        }
                        Err(_) => std::thread::yield_now(),
                    }
                })
            })
            .collect();
        for c in consumers {
            c.join().unwrap();
        }

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len() as u64, total);
    }
}
