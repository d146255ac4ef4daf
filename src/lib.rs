//! arena-ds - a zoo of lock-free and wait-free concurrent data structures
//! allocated out of a shared-memory arena.
//!
//! Every structure here shares three things: a [`contract::Payload`] as its
//! element type, a carve-everything-from-the-[`arena::Arena`] allocation
//! discipline, and the same uniform operation surface —
//! `insert`/`delete`/`pop`/`search`/`verify`/`get_metadata` — returning
//! [`error::ArenaError`] (or its wire-stable twin, [`contract::ResultCode`]).
//!
//! # Structures
//!
//! - [`list::List`] - single-writer doubly-linked map
//! - [`msqueue::MsQueue`] - Michael-Scott lock-free MPMC FIFO
//! - [`mpmc::Mpmc`] - Vyukov bounded MPMC ring
//! - [`mpsc::Mpsc`] - Vyukov unbounded MPSC queue
//! - [`spsc::Spsc`] - fixed-capacity SPSC ring buffer
//! - [`ck_spsc::CkSpsc`] - SPSC intrusive node FIFO with recycling
//! - [`bst::Bst`] - Ellen non-blocking binary search tree
//!
//! # Example
//!
//! ```
//! use arena_ds::{Arena, MsQueue};
//! use std::sync::Arc;
//!
//! let arena = Arc::new(Arena::new(4, arena_ds::DEFAULT_PAGE_SIZE));
//! let queue = MsQueue::new(arena);
//! queue.insert(1, 100).unwrap();
//! assert_eq!(queue.delete().unwrap().value, 100);
//! ```

mod backoff;

pub mod arena;
pub mod bst;
pub mod ck_spsc;
pub mod contract;
pub mod error;
pub mod list;
pub mod metrics;
pub mod mpmc;
pub mod mpsc;
pub mod msqueue;
pub mod spsc;

pub use arena::{Arena, DEFAULT_PAGE_SIZE};
pub use backoff::Backoff;
pub use bst::Bst;
pub use ck_spsc::CkSpsc;
pub use contract::{Metadata, Payload, ResultCategory, ResultCode};
pub use error::{ArenaError, ArenaResult};
pub use list::List;
pub use metrics::{Metrics, MetricsSnapshot};
pub use mpmc::Mpmc;
pub use mpsc::Mpsc;
pub use msqueue::MsQueue;
pub use spsc::Spsc;
