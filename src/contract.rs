//! The uniform operation contract shared by every structure in this crate
//! (spec §4.B, §6, §7).
//!
//! Every structure exposes `init`, `insert`, `delete`, `pop`, `search`,
//! `verify`, and `get_metadata`, all returning one of the [`ResultCode`]
//! values below. The numeric values are fixed for cross-process
//! compatibility (spec §6): a driver on the other side of the arena decodes
//! the same i32 regardless of which language produced it.

use std::fmt;

/// A key-value payload. Neither field is interpreted by the library; ordered
/// structures use `key` as the ordering dimension (spec §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Payload {
    pub key: u64,
    pub value: u64,
}

impl Payload {
    #[must_use]
    pub const fn new(key: u64, value: u64) -> Self {
        Self { key, value }
    }
}

/// Fixed numeric result codes (spec §6). Success is zero; every failure mode
/// is a distinct negative value so a driver can match on the raw code
/// without linking against this crate's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    NotFound = -1,
    Exists = -2,
    OutOfMemory = -3,
    Invalid = -4,
    Corrupt = -5,
    Busy = -6,
    Full = -7,
}

impl ResultCode {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::NotFound => "not-found",
            Self::Exists => "exists",
            Self::OutOfMemory => "out-of-memory",
            Self::Invalid => "invalid",
            Self::Corrupt => "corrupt",
            Self::Busy => "busy",
            Self::Full => "full",
        };
        f.write_str(s)
    }
}

/// A self-describing record every structure can report (spec §4.B).
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub name: &'static str,
    pub description: &'static str,
    pub node_size: usize,
    pub requires_locking: bool,
}

/// Taxonomy helper: classifies a [`ResultCode`] the way spec §7 does, so
/// callers can dispatch on category rather than on the exact code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCategory {
    /// Logical absence / vacancy: caller's natural control flow.
    Vacancy,
    /// Duplicate or capacity: caller chooses policy.
    CapacityOrDuplicate,
    /// Resource exhaustion: propagate unchanged.
    ResourceExhaustion,
    /// Contention: caller retries after its own back-off.
    Contention,
    /// Programmer error: fatal from the caller's view.
    ProgrammerError,
    /// Structural corruption: reported only by verify.
    Corruption,
    Success,
}

impl ResultCode {
    #[must_use]
    pub const fn category(self) -> ResultCategory {
        match self {
            Self::Success => ResultCategory::Success,
            Self::NotFound => ResultCategory::Vacancy,
            Self::Exists | Self::Full => ResultCategory::CapacityOrDuplicate,
            Self::OutOfMemory => ResultCategory::ResourceExhaustion,
            Self::Busy => ResultCategory::Contention,
            Self::Invalid => ResultCategory::ProgrammerError,
            Self::Corrupt => ResultCategory::Corruption,
        }
    }
}
