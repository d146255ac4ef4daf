//! Approximate, relaxed-atomic observability counters.
//!
//! Spec §9 is explicit that every count field in this library is an
//! approximation: "these are not part of the linearization; treat them as
//! an approximation, update with relaxed atomics, and never use them to
//! drive correctness decisions." This mirrors the teacher's `Metrics`
//! (`channel.rs`/`ring.rs`), generalized from message/batch counts to the
//! retry-budget and helping-protocol counters the lock-free structures in
//! this crate need.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters, cheap enough to update on every hot-path operation.
#[derive(Debug, Default)]
pub struct Metrics {
    inserts: AtomicU64,
    deletes: AtomicU64,
    retries: AtomicU64,
    helped: AtomicU64,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_helped(&self) {
        self.helped.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            helped: self.helped.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`Metrics`], safe to hand to a caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub inserts: u64,
    pub deletes: u64,
    pub retries: u64,
    pub helped: u64,
}
