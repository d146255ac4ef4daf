//! Page-level bookkeeping for the arena allocator (spec §4.A).
//!
//! Each page is a fixed-size, 8-byte-aligned byte buffer. The last 8 bytes
//! of every in-use page hold an object counter: incremented on every
//! allocation carved out of the page, decremented on every free, and the
//! page is returned to the pool only once the counter reaches zero. The
//! same 8 bytes double as the free-list's `next` link while the page sits
//! in the pool (a page has no live objects while free, so there is no
//! conflict between the two uses).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// A single page owned by the arena. `size` bytes total; the counter lives
/// in the trailing 8 bytes, so usable space for allocations is `size - 8`.
pub(crate) struct Page {
    data: NonNull<u8>,
    size: usize,
}

impl Page {
    /// # Safety
    /// `data` must point to a `size`-byte, 8-byte-aligned allocation that
    /// this `Page` takes ownership of for its lifetime.
    pub(crate) unsafe fn from_raw(data: NonNull<u8>, size: usize) -> Self {
        debug_assert!(size >= 16, "page must hold at least the counter plus one slot");
        debug_assert_eq!(data.as_ptr() as usize % 8, 0, "page must be 8-byte aligned");
        Self { data, size }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Usable bytes for allocations (total size minus the trailing counter).
    #[inline]
    pub(crate) fn usable_size(&self) -> usize {
        self.size - std::mem::size_of::<usize>()
    }

    #[inline]
    fn counter_ptr(&self) -> *const AtomicUsize {
        // SAFETY: the trailing `size_of::<usize>()` bytes of every page are
        // reserved for the object counter and are usize-aligned because the
        // page itself is 8-byte aligned and `size` is a multiple of 8.
        unsafe { self.data.as_ptr().add(self.usable_size()).cast::<AtomicUsize>() }
    }

    #[inline]
    fn counter(&self) -> &AtomicUsize {
        // SAFETY: counter_ptr always refers to a valid AtomicUsize-sized
        // region within this page's allocation.
        unsafe { &*self.counter_ptr() }
    }

    /// Object count currently live in this page.
    #[inline]
    pub(crate) fn object_count(&self) -> usize {
        self.counter().load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn reset_counter(&self) {
        self.counter().store(0, Ordering::Relaxed);
    }

    /// Record one more live allocation in this page.
    #[inline]
    pub(crate) fn increment(&self) {
        self.counter().fetch_add(1, Ordering::Relaxed);
    }

    /// Record one fewer live allocation in this page. Returns the count
    /// *after* the decrement: callers return the page to the pool when this
    /// reaches zero.
    ///
    /// Uses an atomic fetch-sub because spec §5 requires free from arbitrary
    /// threads (not just the allocating one) to serialize correctly.
    #[inline]
    pub(crate) fn decrement(&self) -> usize {
        self.counter().fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Read the free-list `next` link stored in the first machine word of
    /// this (currently free) page.
    #[inline]
    fn next_link(&self) -> *const AtomicPtr<()> {
        self.data.as_ptr().cast::<AtomicPtr<()>>()
    }
}

/// Lock-free (Treiber) stack of free pages.
///
/// Pages are linked through their own first machine word while free, so the
/// pool itself needs no extra storage beyond a head pointer.
pub(crate) struct PagePool {
    head: AtomicPtr<()>,
}

impl PagePool {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Push a page onto the free list. The page must have an object count
    /// of zero.
    pub(crate) fn push(&self, page: &Page) {
        debug_assert_eq!(page.object_count(), 0, "returned page must be empty");
        let link = page.next_link();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: link points into the page we're about to publish into
            // the free list; nothing else writes to a page's first word
            // while it's free.
            unsafe { &*link }.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                page.as_ptr().cast(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pop a page from the free list, if any is available.
    pub(crate) fn pop(&self, page_size: usize) -> Option<Page> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }
            // SAFETY: `head` was pushed by `push`, so its first word holds a
            // valid `next` link (possibly null).
            let next = unsafe { &*(head.cast::<AtomicPtr<()>>()) }.load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                next,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // SAFETY: `head` is a page-sized, page-aligned
                    // allocation previously handed to `push`.
                    let page = unsafe {
                        Page::from_raw(NonNull::new_unchecked(head.cast::<u8>()), page_size)
                    };
                    page.reset_counter();
                    return Some(page);
                }
                Err(actual) => head = actual,
            }
        }
    }
}
