// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error type for the lock subsystem.
// Capacity exhaustion is deliberately distinct from OS "no space" errors so
// operators can tell a sizing problem from a disk problem.

use std::io;

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the lock segment and lock manager.
#[derive(Error, Debug)]
pub enum Error {
    /// A segment was requested with zero locks.
    #[error("number of locks must be greater than 0")]
    InvalidNumLocks,

    /// The segment path is not a usable POSIX shm name.
    #[error("invalid lock segment path {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The segment handle has already been closed.
    #[error("lock segment is closed")]
    Closed,

    /// Every slot in the segment is allocated.
    #[error("all {limit} lock slots are allocated; raise num_locks to run more containers")]
    CapacityExhausted { limit: u32 },

    /// A slot index at or beyond the segment capacity.
    #[error("lock index {index} is out of range (segment holds {max} locks)")]
    IndexOutOfRange { index: u32, max: u32 },

    /// Allocation of a specific slot that is already taken.
    #[error("lock {index} is already allocated")]
    AlreadyAllocated { index: u32 },

    /// Deallocation of a slot that is not allocated.
    #[error("lock {index} is not allocated")]
    NotAllocated { index: u32 },

    /// Unlock of a slot the calling thread does not hold.
    #[error("lock {index} is not held by this thread")]
    NotLocked { index: u32 },

    /// The named object exists but is not a lock segment (bad magic or
    /// layout version).
    #[error("shared memory object {path:?} is not a lock segment")]
    NotLockSegment { path: String },

    /// Shared-memory locking is not available on this platform.
    #[error("shared memory locks are not supported on this platform")]
    Unsupported,

    /// An OS-level failure, tagged with the operation and segment path.
    #[error("{op} failed for lock segment {path:?}")]
    Os {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Whether this error means the named segment does not exist.
    /// Used by callers that open an existing segment and fall back to
    /// creating a fresh one.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Os { source, .. } if source.kind() == io::ErrorKind::NotFound
        )
    }
}
