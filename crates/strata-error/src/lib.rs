#![forbid(unsafe_code)]
//! Error types for strata.
//!
//! Defines `StrataError` and a `Result<T>` alias used throughout the
//! workspace, with the errno mapping the block front-end reports on
//! completed bios.

use thiserror::Error;

/// Unified error type for all strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    /// A lock could not be re-acquired or a cache race was lost; the
    /// caller retries from its last valid point. Never surfaced to a bio.
    #[error("transient lock/cache race, retry")]
    Retry,

    /// The node cache could not allocate and the caller did not hold the
    /// cannibalize lock. Callers wait or propagate; never fatal here.
    #[error("btree node cache exhausted")]
    NoMem,

    /// An extent had no usable pointer: every replica was stale or on a
    /// missing device. Fatal for that I/O.
    #[error("no device to read from")]
    NoDisk,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blockdev-volume write could not obtain a disk reservation.
    #[error("no space left in cache set")]
    NoSpace,

    /// The device the bio targets is detaching.
    #[error("device detaching")]
    NoDev,

    /// Journal or btree consistency check failed; the cache set goes
    /// read-only and all in-flight I/O is errored out.
    #[error("cache set inconsistent: {0}")]
    Inconsistent(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl StrataError {
    /// Errors the engine recovers from locally (iterator retry,
    /// allocator wait) rather than surfacing to the bio.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Retry | Self::NoMem)
    }

    /// Errno reported on the originating bio.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Retry | Self::NoMem => libc::EAGAIN,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoDisk | Self::Inconsistent(_) => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::NoDev => libc::ENODEV,
            Self::InvalidConfig(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `StrataError`.
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(StrataError::Retry.is_transient());
        assert!(StrataError::NoMem.is_transient());
        assert!(!StrataError::NoDisk.is_transient());
        assert!(!StrataError::NoSpace.is_transient());
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(StrataError::NoDisk.to_errno(), libc::EIO);
        assert_eq!(StrataError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(StrataError::NoDev.to_errno(), libc::ENODEV);
        assert_eq!(
            StrataError::Inconsistent("journal write failed".to_owned()).to_errno(),
            libc::EIO
        );
    }
}
