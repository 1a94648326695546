// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock manager facade: allocation and retrieval of lock handles.
// Containers and pods persist only the numeric lock ID; any process can
// rebuild a working handle from it later.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::segment::LockSegment;

/// Allocates, retrieves and frees locks backed by one shared segment.
pub struct ShmLockManager {
    segment: Arc<LockSegment>,
}

impl ShmLockManager {
    /// Create a fresh segment at `path` with (at least) `num_locks` slots
    /// and wrap it. Fails if the segment already exists.
    pub fn new(path: &str, num_locks: u32) -> Result<Self> {
        let segment = LockSegment::create(path, num_locks)?;
        Ok(Self {
            segment: Arc::new(segment),
        })
    }

    /// Open the existing segment at `path`.
    pub fn open(path: &str, num_locks: u32) -> Result<Self> {
        let segment = LockSegment::open(path, num_locks)?;
        Ok(Self {
            segment: Arc::new(segment),
        })
    }

    /// Open the segment at `path`, creating it when it does not exist yet.
    /// The usual engine startup sequence.
    pub fn open_or_create(path: &str, num_locks: u32) -> Result<Self> {
        match Self::open(path, num_locks) {
            Err(e) if e.is_not_found() => {
                debug!(path, "no lock segment found, creating one");
                Self::new(path, num_locks)
            }
            other => other,
        }
    }

    /// Allocate the lowest free lock and return a handle to it. The
    /// caller persists [`ShmLock::id`] as part of its durable state.
    pub fn allocate_lock(&self) -> Result<ShmLock> {
        let id = self.segment.allocate_semaphore()?;
        Ok(self.handle(id))
    }

    /// Allocate the lock with a specific ID, for callers that renumber
    /// locks from persisted state. Fails if the ID is taken.
    pub fn allocate_given_lock(&self, id: u32) -> Result<ShmLock> {
        self.segment.allocate_given_semaphore(id)?;
        Ok(self.handle(id))
    }

    /// Rebuild a handle from a persisted ID.
    ///
    /// Only the range is validated; allocation state is deliberately not
    /// checked, so a stale ID whose lock was freed by another process still
    /// yields a handle that can lock and unlock (and thereby discover the
    /// owner is gone).
    pub fn retrieve_lock(&self, id: u32) -> Result<ShmLock> {
        let max = self.segment.num_locks();
        if id >= max {
            return Err(Error::IndexOutOfRange { index: id, max });
        }
        Ok(self.handle(id))
    }

    /// Deallocate every lock. For engine-wide resets such as lock
    /// renumbering; held mutexes are left untouched.
    pub fn free_all_locks(&self) -> Result<()> {
        self.segment.deallocate_all_semaphores()
    }

    /// Number of locks still free for allocation.
    pub fn available_locks(&self) -> Result<u32> {
        self.segment.available_locks()
    }

    /// IDs of allocated locks whose mutex is currently held. A lock held
    /// for an extended period here usually points at a stuck operation.
    pub fn locks_held(&self) -> Result<Vec<u32>> {
        let mut held = Vec::new();
        for id in self.segment.allocated_indices()? {
            if self.segment.semaphore_in_use(id)? {
                held.push(id);
            }
        }
        Ok(held)
    }

    /// Total slot capacity of the backing segment (post-rounding).
    pub fn num_locks(&self) -> u32 {
        self.segment.num_locks()
    }

    /// Access the backing segment, for teardown (`close`) in tests.
    pub fn segment(&self) -> &LockSegment {
        &self.segment
    }

    fn handle(&self, id: u32) -> ShmLock {
        ShmLock {
            segment: Arc::clone(&self.segment),
            id,
        }
    }
}

/// A handle to one lock slot: the segment reference plus the slot index,
/// nothing else. Cheap to clone; all clones refer to the same slot.
#[derive(Clone)]
pub struct ShmLock {
    segment: Arc<LockSegment>,
    id: u32,
}

impl ShmLock {
    /// The persistable identity of this lock. Round-trips exactly through
    /// [`ShmLockManager::retrieve_lock`].
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Block until the lock is acquired. Lock and unlock must happen on
    /// the same OS thread; the underlying mutex tracks its owner.
    pub fn lock(&self) -> Result<()> {
        self.segment.lock_semaphore(self.id)
    }

    /// Release the lock. Fails if the calling thread does not hold it.
    pub fn unlock(&self) -> Result<()> {
        self.segment.unlock_semaphore(self.id)
    }

    /// Return the lock's slot to the free pool. The ID may be handed out
    /// again by the next allocation.
    pub fn free(&self) -> Result<()> {
        self.segment.deallocate_semaphore(self.id)
    }
}

impl fmt::Debug for ShmLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmLock").field("id", &self.id).finish()
    }
}
