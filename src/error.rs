//! Error and status types.
//!
//! Only three kinds of failure leave this crate as values: thread creation
//! failure at pool construction, scratch allocation failure, and best-effort
//! platform failures (which are logged, not propagated, by the pool itself).
//! Cooperative aborts are not errors; they are reported through [`Status`].

use std::io;
use thiserror::Error;

/// Terminal status of one `compute()` epoch.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Every node ran to completion.
    Success = 0,
    /// The abort predicate fired; nodes after the abort point were skipped.
    Aborted = 1,
    /// The plan needs scratch memory but none was attached or it could not be allocated.
    AllocFailed = 2,
}

impl Status {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Success,
            1 => Status::Aborted,
            _ => Status::AllocFailed,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to spawn worker thread {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("scratch allocation failed: {0}")]
    Scratch(#[from] ScratchError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScratchError {
    #[error("invalid scratch layout for {size} bytes")]
    Layout { size: usize },

    #[error("out of memory allocating {size} bytes of scratch")]
    OutOfMemory { size: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("{call} failed with os error {code}")]
    Os { call: &'static str, code: i32 },

    #[error("cpu mask is empty")]
    EmptyMask,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_u8() {
        for status in [Status::Success, Status::Aborted, Status::AllocFailed] {
            assert_eq!(Status::from_u8(status as u8), status);
        }
        assert!(Status::Success.is_success());
        assert!(!Status::Aborted.is_success());
    }

    #[test]
    fn test_spawn_error_message() {
        let err = PoolError::Spawn {
            index: 3,
            source: io::Error::new(io::ErrorKind::Other, "no threads left"),
        };
        assert_eq!(
            err.to_string(),
            "failed to spawn worker thread 3: no threads left"
        );
    }
}
