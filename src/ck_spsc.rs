//! CK-style single-producer/single-consumer intrusive node FIFO
//! (spec §3.3, §4.H).
//!
//! Structurally a stub-based linked queue like [`crate::msqueue`], but
//! restricted to one producer and one consumer so neither side needs a CAS
//! to claim a slot — a plain release-store link is enough. The other
//! difference from the array-backed [`crate::spsc`] ring is node recycling:
//! every node the consumer retires is pushed onto a small garbage stack
//! instead of being freed back to the arena, and the producer drains that
//! stack before ever calling into the arena, so steady-state traffic does
//! not allocate once the stack has warmed up.

use crate::arena::Arena;
use crate::contract::{Metadata, Payload};
use crate::error::{ArenaError, ArenaResult};
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

/// A single-producer/single-consumer FIFO with node recycling.
pub struct CkSpsc {
    arena: Arc<Arena>,
    /// Consumer-owned.
    head: UnsafeCell<*mut Node>,
    /// Producer-owned.
    tail: UnsafeCell<*mut Node>,
    /// Retired nodes available for the producer to reuse. Pushed by the
    /// consumer, popped by the producer; a Treiber stack because the two
    /// sides run on different threads even though each only ever pushes or
    /// only ever pops.
    garbage: AtomicPtr<Node>,
    count: AtomicUsize,
}

impl CkSpsc {
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
            head: UnsafeCell::new(stub),
            tail: UnsafeCell::new(stub),
            garbage: AtomicPtr::new(std::ptr::null_mut()),
            count: AtomicUsize::new(0),
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

    fn push_garbage(&self, node: *mut Node) {
        let mut head = self.garbage.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` was just unlinked by the consumer and is not
            // reachable from the live queue any more.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self.garbage.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn pop_garbage(&self) -> Option<*mut Node> {
        let mut head = self.garbage.load(Ordering::Acquire);
        loop {
            let node = NonNull::new(head)?;
            // SAFETY: nodes on the garbage stack are exclusively owned by
            // it until popped.
            let next = unsafe { node.as_ref().next.load(Ordering::Relaxed) };
            match self.garbage.compare_exchange_weak(
                head,
                next,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(node.as_ptr()),
                Err(actual) => head = actual,
            }
        }
    }

    /// Producer-only: appends `(key, value)`, reusing a retired node from
    /// the garbage stack when one is available (spec §4.H).
    pub fn insert(&self, key: u64, value: u64) -> ArenaResult<()> {
        let node = match self.pop_garbage() {
            Some(recycled) => recycled,
            None => {
                let raw = self
                    .arena
                    .alloc(size_of::<Node>())
                    .ok_or(ArenaError::OutOfMemory)?;
                raw.as_ptr().cast::<Node>()
            }
        };

        // SAFETY: `node` is either freshly allocated or popped off the
        // garbage stack, in both cases exclusively owned by the producer
        // until the link-store below publishes it.
        unsafe {
            (*node).next.store(std::ptr::null_mut(), Ordering::Relaxed);
            (*node).key = key;
            (*node).value = value;
        }

        // SAFETY: `tail` is producer-owned and always points at a live,
        // previously-published node.
        unsafe {
            let tail = *self.tail.get();
            (*tail).next.store(node, Ordering::Release);
            *self.tail.get() = node;
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Consumer-only: pops the oldest element, retiring the old dummy node
    /// onto the garbage stack for the producer to reuse.
    pub fn delete(&self) -> ArenaResult<Payload> {
        // SAFETY: `head` is consumer-owned.
        let head = unsafe { *self.head.get() };
        // SAFETY: head is always a live node owned by this queue.
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        let Some(next_node) = NonNull::new(next) else {
            return Err(ArenaError::NotFound);
        };
        // SAFETY: next_node was just published by the producer's release
        // store and holds a valid key/value pair.
        let payload = unsafe { Payload::new(next_node.as_ref().key, next_node.as_ref().value) };
        // SAFETY: consumer-only mutation.
        unsafe { *self.head.get() = next_node.as_ptr() };
        self.push_garbage(head);
        self.count.fetch_sub(1, Ordering::Relaxed);
        Ok(payload)
    }

    /// Convenience wrapper equivalent to [`CkSpsc::delete`] (spec §4.B
    /// `pop`).
    pub fn pop(&self) -> ArenaResult<Payload> {
        self.delete()
    }

    /// Consumer-only linear scan for `key`.
    #[must_use]
    pub fn search(&self, key: u64) -> Option<Payload> {
        // SAFETY: consumer-only read.
        let mut cursor = unsafe { *self.head.get() };
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

    /// Bounded-step integrity check: confirms the chain from `head`
    /// terminates without cycling (spec §4.H).
    pub fn verify(&self) -> ArenaResult<()> {
        // SAFETY: consumer-only read.
        let mut cursor = unsafe { *self.head.get() };
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
            name: "ck_spsc",
            description: "single-producer/single-consumer intrusive node FIFO with recycling",
            node_size: size_of::<Node>(),
            requires_locking: false,
        }
    }
}

// SAFETY: `head`/`tail` are each mutated by exactly one side under the
// single-producer/single-consumer contract documented on `insert`/`delete`;
// the garbage stack is a proper lock-free stack shared between them.
unsafe impl Send for CkSpsc {}
unsafe impl Sync for CkSpsc {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn new_fifo() -> CkSpsc {
        CkSpsc::new(Arc::new(Arena::new(16, crate::arena::DEFAULT_PAGE_SIZE)))
    }

    #[test]
    fn fifo_single_threaded() {
        let q = new_fifo();
        for i in 0..10 {
            q.insert(i, i * 3).unwrap();
        }
        assert!(q.verify().is_ok());
        for i in 0..10 {
            assert_eq!(q.pop().unwrap(), Payload::new(i, i * 3));
        }
        assert_eq!(q.pop(), Err(ArenaError::NotFound));
    }

    #[test]
    fn garbage_nodes_are_recycled_without_new_allocations() {
        // A tiny arena (one page) is enough for thousands of operations if
        // recycling is actually happening, since only the stub plus a
        // handful of in-flight nodes are ever live at once.
        let arena = Arc::new(Arena::new(1, crate::arena::DEFAULT_PAGE_SIZE));
        let q = CkSpsc::new(arena);
        for round in 0..5_000u64 {
            q.insert(round, round).unwrap();
            assert_eq!(q.pop().unwrap(), Payload::new(round, round));
        }
    }

    #[test]
    fn search_finds_pending_key() {
        let q = new_fifo();
        q.insert(1, 10).unwrap();
        q.insert(2, 20).unwrap();
        assert_eq!(q.search(2), Some(Payload::new(2, 20)));
        assert_eq!(q.search(99), None);
    }

    #[test]
    fn concurrent_producer_consumer_preserve_fifo_order() {
        let q = Arc::new(new_fifo());
        const COUNT: u64 = 50_000;

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..COUNT {
                    q.insert(i, i).unwrap();
                }
            })
        };
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut next = 0u64;
                while next < COUNT {
                    match q.delete() {
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
