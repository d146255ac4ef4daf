//! Vyukov intrusive unbounded multi-producer/single-consumer queue
//! (spec §3.3, §4.F).
//!
//! Producers are wait-free: each enqueue is a single atomic exchange on
//! `head` followed by one release-store linking the previous node to the
//! new one. That release-store is the only place the queue can look
//! "broken" from the consumer's side — between the exchange and the link
//! store, the consumer can observe a node whose `next` is still null even
//! though another node logically follows it. The stub node lets the
//! consumer tell "genuinely empty" apart from "producer is mid-link" so it
//! can report [`crate::error::ArenaError::Busy`] instead of a false empty.
//!
//! Only one thread may ever call [`Mpsc::delete`] at a time (spec §4.F).

use crate::arena::Arena;
use crate::contract::{Metadata, Payload};
use crate::error::{ArenaError, ArenaResult};
use crate::metrics::{Metrics, MetricsSnapshot};
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bounded traversal guard for `search`/`verify`.
const MAX_TRAVERSAL: usize = 10_000_000;

#[repr(C)]
struct Node {
    next: AtomicPtr<Node>,
    key: u64,
    value: u64,
}

/// An unbounded multi-producer/single-consumer queue.
pub struct Mpsc {
    arena: Arc<Arena>,
    head: AtomicPtr<Node>,
    /// Consumer-owned; never touched by producers.
    tail: UnsafeCell<*mut Node>,
    stub: *mut Node,
    count: AtomicUsize,
    metrics: Metrics,
}

impl Mpsc {
    /// # Panics
    /// Panics if the arena cannot supply the stub node.
    #[must_use]
    pub fn new(arena: Arc<Arena>) -> Self {
        let raw = arena
            .alloc(size_of::<Node>())
            .expect("arena must have room for the stub node");
        let stub = raw.as_ptr().cast::<Node>();
        // SAFETY: `raw` is a freshly carved, exclusively-owned allocation.
        unsafe {
            stub.write(Node {
                next: AtomicPtr::new(std::ptr::null_mut()),
                key: 0,
                value: 0,
            });
        }
        Self {
            arena,
            head: AtomicPtr::new(stub),
            tail: UnsafeCell::new(stub),
            stub,
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
        self.len() == 0
    }

    /// Links `node` onto the end of the queue. Wait-free: exactly one
    /// atomic swap plus one store, no retry loop.
    fn push_node(&self, node: *mut Node) {
        // SAFETY: `node` is either a freshly allocated, exclusively-owned
        // node, or the stub, which is only ever re-pushed by the sole
        // consumer while it holds no other reference to it.
        unsafe { (*node).next.store(std::ptr::null_mut(), Ordering::Relaxed) };
        let prev = self.head.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` was previously published via this same swap (or is
        // the initial stub) and is never freed until unlinked by the
        // consumer, which only happens after this link store completes.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Enqueues `(key, value)`. Never fails for lack of space; only
    /// allocator exhaustion can fail it (spec §4.F).
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
        self.push_node(node);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.metrics.add_insert();
        Ok(())
    }

    /// Dequeues the oldest element. Must only ever be called by one thread
    /// at a time (spec §4.F). Returns [`ArenaError::Busy`] when a producer
    /// is observed mid-link rather than falsely reporting the queue empty.
    ///
    /// # Safety
    /// The caller must guarantee single-consumer discipline: no two threads
    /// may call `delete` concurrently.
    pub fn delete(&self) -> ArenaResult<Payload> {
        // SAFETY: single-consumer discipline is an API-level contract
        // (spec §4.F); `tail` is otherwise untouched by producers.
        unsafe {
            let mut tail = *self.tail.get();
            let mut next = (*tail).next.load(Ordering::Acquire);

            if tail == self.stub {
                let Some(real_next) = NonNull::new(next) else {
                    if self.head.load(Ordering::Acquire) != tail {
                        // A producer has swapped `head` off the stub but
                        // not yet linked it; the queue is not empty, it's
                        // mid-link (spec §8 scenario 4).
                        self.metrics.add_retry();
                        return Err(ArenaError::Busy);
                    }
                    return Err(ArenaError::NotFound);
                };
                *self.tail.get() = real_next.as_ptr();
                tail = real_next.as_ptr();
                next = (*real_next.as_ptr()).next.load(Ordering::Acquire);
            }

            if let Some(next_node) = NonNull::new(next) {
                *self.tail.get() = next_node.as_ptr();
                let payload = Payload::new((*tail).key, (*tail).value);
                if tail != self.stub {
                    self.arena.free(NonNull::new_unchecked(tail.cast()));
                }
                self.count.fetch_sub(1, Ordering::Relaxed);
                self.metrics.add_delete();
                return Ok(payload);
            }

            let head = self.head.load(Ordering::Acquire);
            if tail != head {
                // A producer has swapped `head` but not yet linked it to
                // `tail`. The element is logically present but unreachable
                // for the moment; tell the caller to retry rather than
                // reporting a false empty.
                self.metrics.add_retry();
                return Err(ArenaError::Busy);
            }

            // Exactly one real node and it's both head and tail. Push the
            // stub to force the pending link to resolve, then check again.
            self.push_node(self.stub);

            next = (*tail).next.load(Ordering::Acquire);
            if let Some(next_node) = NonNull::new(next) {
                *self.tail.get() = next_node.as_ptr();
                let payload = Payload::new((*tail).key, (*tail).value);
                if tail != self.stub {
                    self.arena.free(NonNull::new_unchecked(tail.cast()));
                }
                self.count.fetch_sub(1, Ordering::Relaxed);
                self.metrics.add_delete();
                return Ok(payload);
            }

            Err(ArenaError::NotFound)
        }
    }

    /// Convenience wrapper that retries on [`ArenaError::Busy`] up to a
    /// small bounded number of times before giving up, since busy is a
    /// transient race with a producer's in-flight link store rather than a
    /// steady-state condition (spec §4.B `pop`).
    pub fn pop(&self) -> ArenaResult<Payload> {
        const BUSY_RETRY_BUDGET: usize = 16;
        for _ in 0..BUSY_RETRY_BUDGET {
            match self.delete() {
                Err(ArenaError::Busy) => std::hint::spin_loop(),
                other => return other,
            }
        }
        Err(ArenaError::Busy)
    }

    /// Consumer-only linear scan for `key`, starting just past the current
    /// tail. Safe only under the same single-consumer discipline as
    /// `delete`.
    #[must_use]
    pub fn search(&self, key: u64) -> Option<Payload> {
        // SAFETY: single-consumer discipline; read-only traversal.
        let mut cursor = unsafe { *self.tail.get() };
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

    /// Bounded-step integrity check (spec §4.F): walks from `tail` toward
    /// `head`, bounded, confirming the chain terminates without cycling.
    pub fn verify(&self) -> ArenaResult<()> {
        // SAFETY: single-consumer discipline; read-only traversal.
        let mut cursor = unsafe { *self.tail.get() };
        let mut steps = 0;
        loop {
            if steps >= MAX_TRAVERSAL {
                return Err(ArenaError::Corrupt);
            }
            // SAFETY: cursor is always a live node owned by this queue.
            let next = unsafe { (*cursor).next.load(Ordering::Acquire) };
            if next.is_null() {
                return Ok(());
            }
            cursor = next;
            steps += 1;
        }
    }

    #[must_use]
    pub fn get_metadata() -> Metadata {
        Metadata {
            name: "mpsc",
            description: "Vyukov intrusive unbounded MPSC queue",
            node_size: size_of::<Node>(),
            requires_locking: false,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

// SAFETY: producers only ever touch `head` and the link they just swapped
// out; the consumer owns `tail` exclusively under the single-consumer
// contract documented on `delete`.
unsafe impl Send for Mpsc {}
unsafe impl Sync for Mpsc {}
