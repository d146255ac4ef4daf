//! Idiomatic error type layered over [`crate::contract::ResultCode`].
//!
//! The spec's wire-level contract (§6/§7) is a fixed set of numeric codes so
//! that drivers on either side of the arena can agree on failure modes
//! without sharing a type. Internally, and at the Rust-facing API, this
//! crate uses [`ArenaError`] instead (same shape as the teacher's
//! `ChannelError` in `channel.rs`), which converts losslessly to and from
//! [`ResultCode`].

use crate::contract::ResultCode;
use thiserror::Error;

/// Idiomatic counterpart to [`ResultCode`] for the Rust API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    Exists,
    #[error("arena allocator is out of memory")]
    OutOfMemory,
    #[error("invalid argument")]
    Invalid,
    #[error("structure failed integrity verification")]
    Corrupt,
    #[error("operation exhausted its retry budget")]
    Busy,
    #[error("bounded structure is full")]
    Full,
}

impl ArenaError {
    #[must_use]
    pub const fn code(self) -> ResultCode {
        match self {
            Self::NotFound => ResultCode::NotFound,
            Self::Exists => ResultCode::Exists,
            Self::OutOfMemory => ResultCode::OutOfMemory,
            Self::Invalid => ResultCode::Invalid,
            Self::Corrupt => ResultCode::Corrupt,
            Self::Busy => ResultCode::Busy,
            Self::Full => ResultCode::Full,
        }
    }
}

impl From<ArenaError> for ResultCode {
    fn from(e: ArenaError) -> Self {
        e.code()
    }
}

/// Fallible conversion: [`ResultCode::Success`] has no [`ArenaError`]
/// counterpart, so callers should check for success before converting.
impl TryFrom<ResultCode> for ArenaError {
    type Error = ();

    fn try_from(code: ResultCode) -> Result<Self, Self::Error> {
        match code {
            ResultCode::Success => Err(()),
            ResultCode::NotFound => Ok(Self::NotFound),
            ResultCode::Exists => Ok(Self::Exists),
            ResultCode::OutOfMemory => Ok(Self::OutOfMemory),
            ResultCode::Invalid => Ok(Self::Invalid),
            ResultCode::Corrupt => Ok(Self::Corrupt),
            ResultCode::Busy => Ok(Self::Busy),
            ResultCode::Full => Ok(Self::Full),
        }
    }
}

/// Convenience alias used throughout the structure modules.
pub type ArenaResult<T> = Result<T, ArenaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_roundtrips() {
        for e in [
            ArenaError::NotFound,
            ArenaError::Exists,
            ArenaError::OutOfMemory,
            ArenaError::Invalid,
            ArenaError::Corrupt,
            ArenaError::Busy,
            ArenaError::Full,
        ] {
            let code: ResultCode = e.into();
            assert_eq!(ArenaError::try_from(code), Ok(e));
        }
        assert_eq!(ArenaError::try_from(ResultCode::Success), Err(()));
    }
}
