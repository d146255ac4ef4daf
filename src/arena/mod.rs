//! The shared-memory arena (spec §3.1, §4.A).
//!
//! An arena is a contiguous, page-aligned memory region from which every
//! structure in this crate allocates its nodes. The original project's
//! exotic property — the same region mapped into a kernel-loaded sandbox
//! and an ordinary user process, so raw pointers dereference identically on
//! both sides — is reduced here to an in-process allocator behind a trait
//! boundary (spec §9: "an in-process implementation with multiple threads
//! is sufficient to exercise the core"). The `shared-mmap` feature backs
//! the same allocator with a `MAP_SHARED` anonymous mapping via `libc`, for
//! experiments that actually want a cross-process-shareable region.
//!
//! Allocation is a per-CPU bump-pointer scheme over fixed-size pages
//! (spec §4.A): each shard owns a "current page" and a descending offset
//! into it; the last machine word of every page holds an atomic object
//! counter used for page-level reclamation (§3.1, §5). This crate exposes
//! that scheme as [`Arena::alloc`]/[`Arena::free`] and lets every structure
//! module use `std::sync::atomic` directly on the fields of the node types
//! they carve out of it — `std::sync::atomic::{AtomicU64, AtomicPtr, ...}`
//! already is the C/C++11-model atomics facade spec §4.A asks for
//! (compare-exchange, exchange, fetch-add/sub/and/or, load, store, each
//! parameterized by `Ordering`), so this module does not re-wrap it.

mod page;

use page::{Page, PagePool};
use std::alloc::{alloc as heap_alloc, dealloc as heap_dealloc, Layout};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

/// Default page size. Large enough that the arena's own node types (at most
/// a few hundred bytes) fit comfortably many-to-a-page.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

const COUNTER_SIZE: usize = std::mem::size_of::<usize>();

#[inline]
fn round_up_8(size: usize) -> usize {
    (size + 7) & !7
}

enum Backing {
    Heap { ptr: NonNull<u8>, layout: Layout },
    #[cfg(feature = "shared-mmap")]
    Mmap { ptr: NonNull<u8>, len: usize },
}

/// One per-CPU allocation shard. Guarded by a spinlock rather than true CPU
/// pinning (spec §5 allows either: "by pinning or by guarding with a
/// lightweight spin").
struct Shard {
    busy: AtomicBool,
    current: UnsafeCell<Option<Page>>,
    /// Descending offset into the current page's usable space.
    offset: UnsafeCell<usize>,
}

// SAFETY: all access to `current`/`offset` happens while `busy` is held.
unsafe impl Sync for Shard {}

impl Shard {
    fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            current: UnsafeCell::new(None),
            offset: UnsafeCell::new(0),
        }
    }

    fn lock(&self) {
        while self
            .busy
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// The arena allocator (spec §3.1, §4.A).
pub struct Arena {
    backing: Backing,
    pool: PagePool,
    shards: Box<[Shard]>,
    page_size: usize,
}

// SAFETY: the backing memory is never aliased mutably without going through
// the per-page counter / per-shard spinlock protocol.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates a new arena with room for `capacity_pages` pages of
    /// `page_size` bytes each, backed by ordinary heap memory.
    ///
    /// # Panics
    /// Panics if `page_size` is not a multiple of 8 or smaller than 16
    /// bytes (it must hold at least the trailing counter plus one 8-byte
    /// slot), or if `capacity_pages` is zero.
    #[must_use]
    pub fn new(capacity_pages: usize, page_size: usize) -> Self {
        assert!(capacity_pages > 0, "arena needs at least one page");
        assert!(page_size >= 16 && page_size % 8 == 0, "page_size must be a multiple of 8, >= 16");

        let total = capacity_pages
            .checked_mul(page_size)
            .expect("arena size overflow");
        let layout = Layout::from_size_align(total, page_size).expect("bad arena layout");
        // SAFETY: layout has non-zero size (capacity_pages > 0, page_size >= 16).
        let raw = unsafe { heap_alloc(layout) };
        let ptr = NonNull::new(raw).expect("arena backing allocation failed");

        let arena = Self {
            backing: Backing::Heap { ptr, layout },
            pool: PagePool::new(),
            shards: Self::make_shards(),
            page_size,
        };
        arena.seed_pool(ptr, capacity_pages);
        arena
    }

    /// Creates a new arena backed by a `MAP_SHARED | MAP_ANONYMOUS` mapping,
    /// suitable for sharing with another process that maps the same file
    /// descriptor (spec §3.1, §9's "cross-context pointers" note).
    #[cfg(feature = "shared-mmap")]
    #[must_use]
    pub fn new_shared(capacity_pages: usize, page_size: usize) -> Self {
        assert!(capacity_pages > 0, "arena needs at least one page");
        assert!(page_size >= 16 && page_size % 8 == 0, "page_size must be a multiple of 8, >= 16");

        let len = capacity_pages
            .checked_mul(page_size)
            .expect("arena size overflow");
        // SAFETY: a fixed-size anonymous shared mapping with no file backing;
        // MAP_FAILED is checked below.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert!(raw != libc::MAP_FAILED, "mmap failed for shared arena");
        let ptr = NonNull::new(raw.cast::<u8>()).expect("mmap returned null");

        let arena = Self {
            backing: Backing::Mmap { ptr, len },
            pool: PagePool::new(),
            shards: Self::make_shards(),
            page_size,
        };
        arena.seed_pool(ptr, capacity_pages);
        arena
    }

    fn make_shards() -> Box<[Shard]> {
        let n = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        (0..n).map(|_| Shard::new()).collect()
    }

    fn seed_pool(&self, base: NonNull<u8>, capacity_pages: usize) {
        for i in 0..capacity_pages {
            // SAFETY: base..base+capacity_pages*page_size is the arena's own
            // freshly allocated, page_size-aligned backing memory; slice i
            // is entirely within it and not yet referenced anywhere else.
            let page_ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(i * self.page_size)) };
            let page = unsafe { Page::from_raw(page_ptr, self.page_size) };
            page.reset_counter();
            self.pool.push(&page);
        }
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::Heap { ptr, .. } => ptr.as_ptr(),
            #[cfg(feature = "shared-mmap")]
            Backing::Mmap { ptr, .. } => ptr.as_ptr(),
        }
    }

    #[inline]
    fn shard_for_current_thread(&self) -> &Shard {
        thread_local! {
            static SHARD_HINT: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
        }
        let n = self.shards.len();
        let idx = SHARD_HINT.with(|hint| {
            if let Some(idx) = hint.get() {
                return idx;
            }
            // Thread identity doesn't expose a CPU id in stable std; hash
            // the thread id so each thread sticks to one shard, which is
            // enough to bound cross-core bump-pointer traffic even though
            // it isn't true CPU pinning (spec §5 permits either strategy).
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::thread::current().id().hash(&mut hasher);
            let idx = (hasher.finish() as usize) % n;
            hint.set(Some(idx));
            idx
        });
        &self.shards[idx]
    }

    /// Allocates `size` bytes from the arena, returning `None` if no arena
    /// page is available or `size` is too large for a page (spec §4.A).
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let size = round_up_8(size);
        let usable = self.page_size - COUNTER_SIZE;
        if size == 0 || size >= usable {
            return None;
        }

        let shard = self.shard_for_current_thread();
        shard.lock();
        let result = self.alloc_locked(shard, size);
        shard.unlock();
        result
    }

    fn alloc_locked(&self, shard: &Shard, size: usize) -> Option<NonNull<u8>> {
        loop {
            // SAFETY: called with `shard.busy` held.
            let current = unsafe { &mut *shard.current.get() };
            let offset = unsafe { &mut *shard.offset.get() };

            if let Some(page) = current.as_ref() {
                if *offset >= size {
                    *offset -= size;
                    page.increment();
                    // SAFETY: offset is within [0, usable_size) and size
                    // bytes starting there belong to this page.
                    let ptr = unsafe { page.as_ptr().add(*offset) };
                    return NonNull::new(ptr);
                }
            }

            // Current page (if any) lacks space; fetch a fresh one.
            let fresh = self.pool.pop(self.page_size)?;
            *offset = fresh.usable_size();
            *current = Some(fresh);
        }
    }

    /// Frees a pointer previously returned by [`Arena::alloc`].
    ///
    /// # Safety
    /// `ptr` must have been returned by a prior call to `alloc` on this same
    /// arena and not already freed. Freeing an unknown pointer is undefined
    /// behavior (spec §4.A).
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let base = self.base_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        debug_assert!(addr >= base, "pointer does not belong to this arena");
        let page_addr = base + ((addr - base) / self.page_size) * self.page_size;
        // SAFETY: page_addr is the start of the page containing `ptr`,
        // which the caller guarantees was allocated from this arena.
        let page = Page::from_raw(NonNull::new_unchecked(page_addr as *mut u8), self.page_size);
        if page.decrement() == 0 {
            self.pool.push(&page);
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Heap { ptr, layout } => {
                // SAFETY: this is the same pointer/layout used in `new`, and
                // the arena is the sole owner of the backing allocation.
                unsafe { heap_dealloc(ptr.as_ptr(), *layout) };
            }
            #[cfg(feature = "shared-mmap")]
            Backing::Mmap { ptr, len } => {
                // SAFETY: this is the same pointer/length used in `new_shared`.
                unsafe {
                    libc::munmap(ptr.as_ptr().cast(), *len);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_distinct_non_null_pointers() {
        let arena = Arena::new(4, DEFAULT_PAGE_SIZE);
        let a = arena.alloc(64).unwrap();
        let b = arena.alloc(64).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn alloc_rejects_oversized_request() {
        let arena = Arena::new(1, DEFAULT_PAGE_SIZE);
        assert!(arena.alloc(DEFAULT_PAGE_SIZE).is_none());
    }

    #[test]
    fn balanced_alloc_free_returns_pages_to_pool() {
        let arena = Arena::new(1, DEFAULT_PAGE_SIZE);
        let mut ptrs = Vec::new();
        // Fill the single page completely (minus the counter).
        loop {
            match arena.alloc(64) {
                Some(p) => ptrs.push(p),
                None => break,
            }
        }
        assert!(!ptrs.is_empty());
        for p in ptrs {
            unsafe { arena.free(p) };
        }
        // The page must have been returned to the pool: we can allocate
        // from it again.
        assert!(arena.alloc(64).is_some());
    }

    #[test]
    fn pointer_stable_until_freed() {
        let arena = Arena::new(2, DEFAULT_PAGE_SIZE);
        let p = arena.alloc(8).unwrap();
        unsafe { *p.as_ptr() = 0xAB };
        // Allocate more without touching p.
        for _ in 0..10 {
            arena.alloc(8);
        }
        assert_eq!(unsafe { *p.as_ptr() }, 0xAB);
    }
}
