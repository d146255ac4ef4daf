//! Ellen et al. non-blocking binary search tree (spec §3.3, §4.I).
//!
//! Leaf-oriented: every key-value pair lives in a leaf, and internal nodes
//! only hold routing keys. Two infinite-key sentinel leaves bound the tree
//! on the right so every real key always descends left of the root at
//! least once, which keeps the root itself from ever needing replacement.
//!
//! Every internal node carries an `update` word that is simultaneously a
//! pointer to an operation's descriptor record and a 2-bit state tag
//! (`Clean`, `IFlag`, `Mark`, `DFlag`). A thread that wants to mutate the
//! tree first wins a CAS that plants its descriptor in an ancestor's
//! `update` word, then *helps* — carries out the structural change the
//! descriptor describes — regardless of whether it was the thread that
//! planted the descriptor or one that merely noticed it along the way.
//! That's what makes progress non-blocking: no operation can be stalled by
//! a suspended thread holding a "lock", because any other thread that
//! shows up finishes the job itself.
//!
//! Concurrent insert/delete is lock-free; `search` never touches `update`
//! and is always wait-free.

use crate::arena::Arena;
use crate::backoff::Backoff;
use crate::contract::{Metadata, Payload};
use crate::error::{ArenaError, ArenaResult};
use crate::metrics::{Metrics, MetricsSnapshot};
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Upper bound on a single insert/delete's retry loop. The helping
/// protocol is lock-free system-wide, but an individual call can in theory
/// be starved by contending peers; this bound turns that into a reported
/// [`ArenaError::Busy`] instead of a silent hang.
const RETRY_BUDGET: usize = 1_000;

/// Bounded-depth guard for `search`/`verify` traversals (spec §4.I).
const MAX_DEPTH: usize = 4_096;
const MAX_TRAVERSAL: usize = 10_000_000;
const COUNT_TOLERANCE: usize = 8;

const INF1: u64 = u64::MAX - 1;
const INF2: u64 = u64::MAX;

const STATE_MASK: usize = 0b11;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum UpdateState {
    Clean = 0,
    DFlag = 1,
    IFlag = 2,
    Mark = 3,
}

impl UpdateState {
    fn from_tag(tag: usize) -> Self {
        match tag {
            0 => Self::Clean,
            1 => Self::DFlag,
            2 => Self::IFlag,
            3 => Self::Mark,
            _ => unreachable!("update tag is masked to 2 bits"),
        }
    }
}

#[inline]
fn pack(ptr: *mut (), state: UpdateState) -> usize {
    debug_assert_eq!(ptr as usize & STATE_MASK, 0, "info pointer must be 4-byte aligned");
    (ptr as usize) | state as usize
}

#[inline]
fn unpack(word: usize) -> (*mut (), UpdateState) {
    let state = UpdateState::from_tag(word & STATE_MASK);
    ((word & !STATE_MASK) as *mut (), state)
}

#[repr(C)]
struct Node {
    is_leaf: bool,
    key: u64,
    value: u64,
    left: AtomicPtr<Node>,
    right: AtomicPtr<Node>,
    /// Meaningful only on internal nodes; tagged per [`UpdateState`].
    update: AtomicUsize,
}

impl Node {
    #[inline]
    fn child_slot(&self, child: *mut Node) -> &AtomicPtr<Node> {
        if self.left.load(Ordering::Acquire) == child {
            &self.left
        } else {
            &self.right
        }
    }
}

#[repr(C)]
struct IInfo {
    p: *mut Node,
    new_internal: *mut Node,
    l: *mut Node,
}

#[repr(C)]
struct DInfo {
    gp: *mut Node,
    p: *mut Node,
    l: *mut Node,
    pupdate: usize,
}

struct SearchResult {
    gp: *mut Node,
    gpupdate: usize,
    p: *mut Node,
    pupdate: usize,
    l: *mut Node,
}

/// A lock-free ordered map over `u64` keys.
pub struct Bst {
    arena: Arc<Arena>,
    root: *mut Node,
    count: AtomicUsize,
    metrics: Metrics,
}

impl Bst {
    fn alloc_node(&self) -> ArenaResult<*mut Node> {
        let raw = self.arena.alloc(size_of::<Node>()).ok_or(ArenaError::OutOfMemory)?;
        Ok(raw.as_ptr().cast::<Node>())
    }

    fn alloc_leaf(&self, key: u64, value: u64) -> ArenaResult<*mut Node> {
        let node = self.alloc_node()?;
        // SAFETY: freshly carved, exclusively-owned allocation.
        unsafe {
            node.write(Node {
                is_leaf: true,
                key,
                value,
                left: AtomicPtr::new(std::ptr::null_mut()),
                right: AtomicPtr::new(std::ptr::null_mut()),
                update: AtomicUsize::new(0),
            });
        }
        Ok(node)
    }

    fn alloc_internal(&self, key: u64, left: *mut Node, right: *mut Node) -> ArenaResult<*mut Node> {
        let node = self.alloc_node()?;
        // SAFETY: freshly carved, exclusively-owned allocation.
        unsafe {
            node.write(Node {
                is_leaf: false,
                key,
                value: 0,
                left: AtomicPtr::new(left),
                right: AtomicPtr::new(right),
                update: AtomicUsize::new(0),
            });
        }
        Ok(node)
    }

    /// Builds the initial tree: one internal root routing to the two
    /// infinite-key sentinel leaves (spec §4.I).
    ///
    /// # Panics
    /// Panics if the arena cannot supply the three initial nodes.
    #[must_use]
    pub fn new(arena: Arc<Arena>) -> Self {
        let tmp = Self {
            arena: Arc::clone(&arena),
            root: std::ptr::null_mut(),
            count: AtomicUsize::new(0),
            metrics: Metrics::new(),
        };
        let leaf1 = tmp.alloc_leaf(INF1, 0).expect("arena must have room for sentinel leaves");
        let leaf2 = tmp.alloc_leaf(INF2, 0).expect("arena must have room for sentinel leaves");
        let root = tmp
            .alloc_internal(INF2, leaf1, leaf2)
            .expect("arena must have room for the root");
        Self {
            arena,
            root,
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

    fn search_path(&self, key: u64) -> SearchResult {
        let mut gp: *mut Node = std::ptr::null_mut();
        let mut gpupdate = 0usize;
        let mut p: *mut Node = std::ptr::null_mut();
        let mut pupdate = 0usize;
        let mut l = self.root;
        let mut depth = 0;

        // SAFETY: every pointer dereferenced here was published by a CAS
        // this module performed and is never freed (see module docs: this
        // structure intentionally does not reclaim replaced nodes).
        while !unsafe { (*l).is_leaf } {
            depth += 1;
            debug_assert!(depth <= MAX_DEPTH, "bst traversal exceeded the depth guard");
            gp = p;
            gpupdate = pupdate;
            p = l;
            pupdate = unsafe { (*p).update.load(Ordering::Acquire) };
            let node_key = unsafe { (*l).key };
            l = if key < node_key {
                unsafe { (*l).left.load(Ordering::Acquire) }
            } else {
                unsafe { (*l).right.load(Ordering::Acquire) }
            };
        }

        SearchResult { gp, gpupdate, p, pupdate, l }
    }

    /// Wait-free point lookup (spec §4.I).
    #[must_use]
    pub fn search(&self, key: u64) -> Option<Payload> {
        let result = self.search_path(key);
        // SAFETY: `l` is always a live leaf.
        let leaf = unsafe { &*result.l };
        if leaf.key == key {
            Some(Payload::new(leaf.key, leaf.value))
        } else {
            None
        }
    }

    /// Helps whatever operation `word` describes, dispatching on its state
    /// tag. A no-op when `word` is `Clean`.
    fn help(&self, word: usize) {
        let (ptr, state) = unpack(word);
        match state {
            UpdateState::Clean => {}
            UpdateState::IFlag => {
                // SAFETY: a non-null pointer tagged IFlag always addresses
                // a live `IInfo` planted by `insert`.
                let info = unsafe { &*ptr.cast::<IInfo>() };
                self.help_insert(info, word);
            }
            UpdateState::Mark => {
                // SAFETY: a non-null pointer tagged Mark always addresses
                // a live `DInfo` planted by `delete`.
                let info = unsafe { &*ptr.cast::<DInfo>() };
                self.help_marked(info);
            }
            UpdateState::DFlag => {
                // SAFETY: see Mark.
                let info = unsafe { &*ptr.cast::<DInfo>() };
                self.help_delete(info);
            }
        }
        self.metrics.add_helped();
    }

    fn help_insert(&self, info: &IInfo, iflag_word: usize) {
        // SAFETY: `p` and `l` were read from the tree and are never freed.
        let p = unsafe { &*info.p };
        let slot = p.child_slot(info.l);
        let _ = slot.compare_exchange(
            info.l,
            info.new_internal,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        let clean_word = pack((iflag_word & !STATE_MASK) as *mut (), UpdateState::Clean);
        let _ = p.update.compare_exchange(
            iflag_word,
            clean_word,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Returns `true` if the delete this descriptor describes actually
    /// completed (so the caller should stop retrying), `false` if it was
    /// backed out and the caller must restart its search.
    fn help_delete(&self, info: &DInfo) -> bool {
        let info_ptr = (info as *const DInfo).cast_mut().cast::<()>();
        let dflag_word = pack(info_ptr, UpdateState::DFlag);
        // SAFETY: `p` was read from the tree and is never freed.
        let p = unsafe { &*info.p };
        let mark_word = pack(info_ptr, UpdateState::Mark);
        let mark_result = p.update.compare_exchange(
            info.pupdate,
            mark_word,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );

        let now = p.update.load(Ordering::Acquire);
        if mark_result.is_ok() || now == mark_word {
            self.help_marked(info);
            true
        } else {
            // Someone else changed p first; back out gp's flag.
            // SAFETY: `gp` was read from the tree and is never freed.
            let gp = unsafe { &*info.gp };
            let clean_word = pack(info_ptr, UpdateState::Clean);
            let _ = gp.update.compare_exchange(
                dflag_word,
                clean_word,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            false
        }
    }

    fn help_marked(&self, info: &DInfo) {
        let info_ptr = (info as *const DInfo).cast_mut().cast::<()>();
        // SAFETY: `p` and `gp` were read from the tree and are never freed.
        let p = unsafe { &*info.p };
        let gp = unsafe { &*info.gp };
        let sibling = if p.left.load(Ordering::Acquire) == info.l {
            p.right.load(Ordering::Acquire)
        } else {
            p.left.load(Ordering::Acquire)
        };

        let dflag_word = pack(info_ptr, UpdateState::DFlag);
        let _ = gp
            .child_slot(info.p)
            .compare_exchange(info.p, sibling, Ordering::AcqRel, Ordering::Relaxed);
        let clean_word = pack(info_ptr, UpdateState::Clean);
        let _ = gp.update.compare_exchange(dflag_word, clean_word, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Inserts `(key, value)`, or reports the key already present
    /// (spec §4.I).
    pub fn insert(&self, key: u64, value: u64) -> ArenaResult<()> {
        let mut backoff = Backoff::new();
        for _ in 0..RETRY_BUDGET {
            let path = self.search_path(key);
            // SAFETY: `l` is always a live leaf.
            let existing = unsafe { &*path.l };
            if existing.key == key {
                return Err(ArenaError::Exists);
            }
            let (_, pstate) = unpack(path.pupdate);
            if pstate != UpdateState::Clean {
                self.help(path.pupdate);
                self.metrics.add_retry();
                backoff.spin();
                continue;
            }

            let new_leaf = self.alloc_leaf(key, value)?;
            let (left, right, new_key) = if key < existing.key {
                (new_leaf, path.l, existing.key)
            } else {
                (path.l, new_leaf, key)
            };
            let new_internal = self.alloc_internal(new_key, left, right)?;

            let info = alloc_info::<IInfo>(&self.arena, IInfo {
                p: path.p,
                new_internal,
                l: path.l,
            })?;
            let iflag_word = pack(info.cast::<()>(), UpdateState::IFlag);

            // SAFETY: `p` is always a live internal node.
            let p = unsafe { &*path.p };
            match p.update.compare_exchange(
                path.pupdate,
                iflag_word,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // SAFETY: info was just published above.
                    self.help_insert(unsafe { &*info }, iflag_word);
                    self.count.fetch_add(1, Ordering::Relaxed);
                    self.metrics.add_insert();
                    return Ok(());
                }
                Err(actual) => {
                    self.help(actual);
                    // SAFETY: the CAS above lost, so `new_leaf`,
                    // `new_internal`, and `info` were never linked into the
                    // tree and no other thread can reach them (spec §4.I
                    // step 7, §8 scenario 5).
                    unsafe {
                        self.arena.free(NonNull::new_unchecked(new_leaf.cast()));
                        self.arena.free(NonNull::new_unchecked(new_internal.cast()));
                        self.arena.free(NonNull::new_unchecked(info.cast()));
                    }
                    self.metrics.add_retry();
                    backoff.spin();
                }
            }
        }
        Err(ArenaError::Busy)
    }

    /// Removes the element with `key`, or reports it absent (spec §4.I).
    pub fn delete(&self, key: u64) -> ArenaResult<Payload> {
        let mut backoff = Backoff::new();
        for _ in 0..RETRY_BUDGET {
            let path = self.search_path(key);
            // SAFETY: `l` is always a live leaf.
            let leaf = unsafe { &*path.l };
            if leaf.key != key {
                return Err(ArenaError::NotFound);
            }
            if path.gp.is_null() {
                // Key lives directly under the root with no grandparent to
                // flag; this never happens once the two sentinels are
                // routed through an internal root, but guard it anyway.
                return Err(ArenaError::Invalid);
            }

            let (_, gpstate) = unpack(path.gpupdate);
            if gpstate != UpdateState::Clean {
                self.help(path.gpupdate);
                self.metrics.add_retry();
                backoff.spin();
                continue;
            }

            let payload = Payload::new(leaf.key, leaf.value);
            let info = alloc_info::<DInfo>(&self.arena, DInfo {
                gp: path.gp,
                p: path.p,
                l: path.l,
                pupdate: path.pupdate,
            })?;
            let dflag_word = pack(info.cast::<()>(), UpdateState::DFlag);

            // SAFETY: `gp` is always a live internal node.
            let gp = unsafe { &*path.gp };
            match gp.update.compare_exchange(
                path.gpupdate,
                dflag_word,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // SAFETY: info was just published above.
                    let completed = self.help_delete(unsafe { &*info });
                    if completed {
                        self.count.fetch_sub(1, Ordering::Relaxed);
                        self.metrics.add_delete();
                        return Ok(payload);
                    }
                    self.metrics.add_retry();
                    backoff.spin();
                }
                Err(actual) => {
                    self.help(actual);
                    self.metrics.add_retry();
                    backoff.spin();
                }
            }
        }
        Err(ArenaError::Busy)
    }

    /// Convenience wrapper equivalent to [`Bst::delete`] given the minimum
    /// key currently present (spec §4.B `pop`). Returns `NotFound` on an
    /// empty tree.
    pub fn pop(&self) -> ArenaResult<Payload> {
        let mut cursor = self.root;
        let mut depth = 0;
        // SAFETY: every pointer here was published by this module and is
        // never freed.
        while !unsafe { (*cursor).is_leaf } {
            depth += 1;
            if depth > MAX_DEPTH {
                return Err(ArenaError::Corrupt);
            }
            cursor = unsafe { (*cursor).left.load(Ordering::Acquire) };
        }
        let key = unsafe { (*cursor).key };
        if key == INF1 || key == INF2 {
            return Err(ArenaError::NotFound);
        }
        self.delete(key)
    }

    /// Visits every real key in ascending order, bounded, returning the
    /// number visited (spec §6 `S_iterate`).
    pub fn iterate(&self, mut callback: impl FnMut(Payload)) -> usize {
        let mut stack = vec![self.root];
        let mut visited = 0;
        while let Some(node) = stack.pop() {
            if visited >= MAX_TRAVERSAL {
                break;
            }
            // SAFETY: every pointer on the stack was published by this
            // module and is never freed.
            let n = unsafe { &*node };
            if n.is_leaf {
                if n.key != INF1 && n.key != INF2 {
                    callback(Payload::new(n.key, n.value));
                    visited += 1;
                }
                continue;
            }
            let right = n.right.load(Ordering::Acquire);
            let left = n.left.load(Ordering::Acquire);
            if !right.is_null() {
                stack.push(right);
            }
            if !left.is_null() {
                stack.push(left);
            }
        }
        visited
    }

    /// Bounded structural check: confirms every leaf is reachable, that an
    /// in-order traversal is strictly increasing (the BST invariant), and
    /// that the traversed count roughly matches the stored approximate
    /// count (spec §4.I, §9 open question (a) applied here as well).
    pub fn verify(&self) -> ArenaResult<()> {
        let mut last_key: Option<u64> = None;
        let mut visited = 0usize;
        let mut ok = true;
        self.iterate(|payload| {
            visited += 1;
            if let Some(last) = last_key {
                if payload.key <= last {
                    ok = false;
                }
            }
            last_key = Some(payload.key);
        });
        if !ok {
            return Err(ArenaError::Corrupt);
        }
        if visited.abs_diff(self.len()) > COUNT_TOLERANCE {
            return Err(ArenaError::Corrupt);
        }
        Ok(())
    }

    #[must_use]
    pub fn get_metadata() -> Metadata {
        Metadata {
            name: "bst",
            description: "Ellen non-blocking leaf-oriented binary search tree",
            node_size: size_of::<Node>(),
            requires_locking: false,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Allocates a `T` from the arena and writes `value` into it.
fn alloc_info<T>(arena: &Arena, value: T) -> ArenaResult<*mut T> {
    let raw = arena.alloc(size_of::<T>()).ok_or(ArenaError::OutOfMemory)?;
    let ptr = raw.as_ptr().cast::<T>();
    // SAFETY: freshly carved, exclusively-owned allocation sized for `T`.
    unsafe { ptr.write(value) };
    Ok(ptr)
}

// SAFETY: every internal node's `update` word gates access to its
// operation descriptor; concurrent structural changes are serialized
// through CAS on `update` or the relevant child pointer.
unsafe impl Send for Bst {}
unsafe impl Sync for Bst {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn new_bst() -> Bst {
        Bst::new(Arc::new(Arena::new(256, crate::arena::DEFAULT_PAGE_SIZE)))
    }

    #[test]
    fn insert_then_search_then_delete() {
        let t = new_bst();
        t.insert(10, 100).unwrap();
        assert_eq!(t.search(10), Some(Payload::new(10, 100)));
        assert_eq!(t.delete(10).unwrap(), Payload::new(10, 100));
        assert_eq!(t.search(10), None);
        assert_eq!(t.delete(10), Err(ArenaError::NotFound));
    }

    #[test]
    fn duplicate_insert_reports_exists() {
        let t = new_bst();
        t.insert(5, 50).unwrap();
        assert_eq!(t.insert(5, 99), Err(ArenaError::Exists));
    }

    #[test]
    fn permutation_insert_search_delete_verify() {
        let t = new_bst();
        let keys: Vec<u64> = (0..200).collect();
        let mut shuffled = keys.clone();
        // deterministic pseudo-shuffle, no external RNG dependency needed
        shuffled.sort_by_key(|k| (k.wrapping_mul(2654435761) as u32));

        for &k in &shuffled {
            t.insert(k, k * 2).unwrap();
        }
        assert!(t.verify().is_ok());
        for &k in &keys {
            assert_eq!(t.search(k), Some(Payload::new(k, k * 2)));
        }
        for &k in &shuffled {
            assert_eq!(t.delete(k).unwrap(), Payload::new(k, k * 2));
        }
        assert!(t.is_empty());
        assert!(t.verify().is_ok());
    }

    #[test]
    fn iterate_visits_in_ascending_order() {
        let t = new_bst();
        for k in [5, 3, 8, 1, 4, 7, 9] {
            t.insert(k, k).unwrap();
        }
        let mut seen = Vec::new();
        t.iterate(|p| seen.push(p.key));
        let mut expected = seen.clone();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn concurrent_inserts_at_same_parent_all_survive() {
        let t = Arc::new(new_bst());
        const PER_THREAD: u64 = 500;
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let t = Arc::clone(&t);
                thread::spawn(move || {
                    for j in 0..PER_THREAD {
                        let key = i * PER_THREAD + j;
                        t.insert(key, key).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(t.verify().is_ok());
        for i in 0..8u64 {
            for j in 0..PER_THREAD {
                let key = i * PER_THREAD + j;
                assert_eq!(t.search(key), Some(Payload::new(key, key)));
            }
        }
    }

    #[test]
    fn concurrent_deletes_help_each_other() {
        let t = Arc::new(new_bst());
        for k in 0..1000u64 {
            t.insert(k, k).unwrap();
        }
        let deleters: Vec<_> = (0..4)
            .map(|i| {
                let t = Arc::clone(&t);
                thread::spawn(move || {
                    let mut k = i * 250;
                    while k < (i + 1) * 250 {
                        assert!(t.delete(k).is_ok());
                        k += 1;
                    }
                })
            })
            .collect();
        for d in deleters {
            d.join().unwrap();
        }
        assert!(t.verify().is_ok());
        for k in 0..1000u64 {
            assert_eq!(t.search(k), None);
        }
    }
}
