//! Doubly-linked map-like list (spec §3.3, §4.C).
//!
//! Every element stores `pprev`, the address of the link field that points
//! at it (`head.first` for the first element, or the previous element's
//! `next` field otherwise). That lets `delete` unlink an element in O(1)
//! without a second traversal. This structure is single-writer-safe only
//! (spec §4.C, §9): concurrent writers race on the splice, so callers must
//! serialize inserts/deletes externally (e.g. one producer thread). Reads
//! (`search`, `verify`) are safe to run concurrently with each other.

use crate::arena::Arena;
use crate::contract::{Metadata, Payload};
use crate::error::{ArenaError, ArenaResult};
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bounded traversal guard: catches a corrupted or cyclic list instead of
/// spinning forever (mirrors the bounded-iteration guards used throughout
/// the tree and queue modules).
const MAX_TRAVERSAL: usize = 10_000_000;

#[repr(C)]
struct Node {
    next: AtomicPtr<Node>,
    /// Address of the link field that currently points at this node:
    /// either `&head.first` or the previous node's `&next`.
    pprev: AtomicPtr<AtomicPtr<Node>>,
    key: u64,
    value: u64,
}

/// A doubly-linked key-value list allocated out of a shared [`Arena`].
pub struct List {
    arena: Arc<Arena>,
    first: AtomicPtr<Node>,
    count: AtomicUsize,
}

impl List {
    #[must_use]
    pub fn new(arena: Arc<Arena>) -> Self {
        Self {
            arena,
            first: AtomicPtr::new(std::ptr::null_mut()),
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

    /// Overwrites the value of an existing key, or splices in a new node at
    /// the head (spec §4.C). Only ever call this from one thread at a time.
    pub fn insert(&self, key: u64, value: u64) -> ArenaResult<()> {
        let mut cursor = self.first.load(Ordering::Acquire);
        while let Some(node) = NonNull::new(cursor) {
            // SAFETY: `cursor` was read from a link field this list owns;
            // single-writer discipline means no concurrent free can race
            // with this read.
            let node = unsafe { node.as_ref() };
            if node.key == key {
                // SAFETY: single-writer; overwriting in place is sound.
                unsafe {
                    let value_ptr = std::ptr::addr_of!(node.value).cast_mut();
                    *value_ptr = value;
                }
                return Ok(());
            }
            cursor = node.next.load(Ordering::Relaxed);
        }

        let raw = self
            .arena
            .alloc(size_of::<Node>())
            .ok_or(ArenaError::OutOfMemory)?;
        let node_ptr = raw.as_ptr().cast::<Node>();
        let old_first = self.first.load(Ordering::Relaxed);

        // SAFETY: `raw` is a freshly carved, exclusively-owned allocation
        // large enough for `Node`, suitably aligned (arena rounds to 8,
        // `Node`'s alignment is 8).
        unsafe {
            node_ptr.write(Node {
                next: AtomicPtr::new(old_first),
                pprev: AtomicPtr::new(std::ptr::addr_of!(self.first).cast_mut()),
                key,
                value,
            });
        }

        if let Some(old) = NonNull::new(old_first) {
            // SAFETY: old_first is a live node owned by this list.
            unsafe {
                (*old.as_ptr())
                    .pprev
                    .store(std::ptr::addr_of!((*node_ptr).next).cast_mut(), Ordering::Relaxed);
            }
        }

        self.first.store(node_ptr, Ordering::Release);
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Unlinks and frees the element with the given key (spec §4.C).
    pub fn delete(&self, key: u64) -> ArenaResult<Payload> {
        let mut cursor = self.first.load(Ordering::Acquire);
        while let Some(node) = NonNull::new(cursor) {
            // SAFETY: see `insert`.
            let node_ref = unsafe { node.as_ref() };
            if node_ref.key != key {
                cursor = node_ref.next.load(Ordering::Relaxed);
                continue;
            }

            let payload = Payload::new(node_ref.key, node_ref.value);
            let next = node_ref.next.load(Ordering::Relaxed);
            let pprev = node_ref.pprev.load(Ordering::Relaxed);

            // SAFETY: pprev always points at either `self.first` or a live
            // predecessor's `next` field.
            unsafe { (*pprev).store(next, Ordering::Release) };

            if let Some(next_node) = NonNull::new(next) {
                // SAFETY: next is a live node owned by this list.
                unsafe { (*next_node.as_ptr()).pprev.store(pprev, Ordering::Relaxed) };
            }

            // SAFETY: node was allocated from this arena by `insert` and is
            // being unlinked exactly once under single-writer discipline.
            unsafe { self.arena.free(node.cast()) };
            self.count.fetch_sub(1, Ordering::Relaxed);
            return Ok(payload);
        }
        Err(ArenaError::NotFound)
    }

    /// Linear scan for `key` (spec §4.C). Safe to call concurrently with
    /// other reads, or with the single writer.
    #[must_use]
    pub fn search(&self, key: u64) -> Option<Payload> {
        let mut cursor = self.first.load(Ordering::Acquire);
        let mut steps = 0;
        while let Some(node) = NonNull::new(cursor) {
            if steps >= MAX_TRAVERSAL {
                return None;
            }
            // SAFETY: see `insert`.
            let node = unsafe { node.as_ref() };
            if node.key == key {
                return Some(Payload::new(node.key, node.value));
            }
            cursor = node.next.load(Ordering::Relaxed);
            steps += 1;
        }
        None
    }

    /// Visits every element in traversal order, returning the number
    /// visited (spec §6 `S_iterate`).
    pub fn iterate(&self, mut callback: impl FnMut(Payload)) -> usize {
        let mut cursor = self.first.load(Ordering::Acquire);
        let mut visited = 0;
        while let Some(node) = NonNull::new(cursor) {
            if visited >= MAX_TRAVERSAL {
                break;
            }
            // SAFETY: see `insert`.
            let node = unsafe { node.as_ref() };
            callback(Payload::new(node.key, node.value));
            cursor = node.next.load(Ordering::Relaxed);
            visited += 1;
        }
        visited
    }

    /// Confirms every node's `pprev` points back at the link field that
    /// references it, and that the traversed count matches the stored count
    /// (spec §4.C).
    pub fn verify(&self) -> ArenaResult<()> {
        let mut expected_pprev: *mut AtomicPtr<Node> = std::ptr::addr_of!(self.first).cast_mut();
        let mut cursor = self.first.load(Ordering::Acquire);
        let mut visited = 0;

        while let Some(node) = NonNull::new(cursor) {
            if visited >= MAX_TRAVERSAL {
                return Err(ArenaError::Corrupt);
            }
            // SAFETY: see `insert`.
            let node = unsafe { node.as_ref() };
            if node.pprev.load(Ordering::Relaxed) != expected_pprev {
                return Err(ArenaError::Corrupt);
            }
            expected_pprev = std::ptr::addr_of!(node.next).cast_mut();
            cursor = node.next.load(Ordering::Relaxed);
            visited += 1;
        }

        if visited != self.len() {
            return Err(ArenaError::Corrupt);
        }
        Ok(())
    }

    #[must_use]
    pub fn get_metadata() -> Metadata {
        Metadata {
            name: "list",
            description: "single-writer doubly-linked key-value map",
            node_size: size_of::<Node>(),
            requires_locking: true,
        }
    }
}

// SAFETY: all mutation is either externally serialized (writer side, per
// spec §4.C) or confined to atomics with documented ordering.
unsafe impl Send for List {}
unsafe impl Sync for List {}
