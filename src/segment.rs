// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Public lock segment handle.
// Delegates to platform::PlatformSegment (POSIX or unsupported stub).

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::platform::{round_up_locks, PlatformSegment};
use crate::BITMAP_WORD_BITS;

/// A named shared-memory segment holding lock slots.
///
/// The segment is shared between every process that opens the same name;
/// this handle is per-process. Slot allocation state (the bitmap) and slot
/// lock state (the mutexes) are deliberately independent: a slot can be
/// locked while unallocated, and locking never consults the bitmap.
#[derive(Debug)]
pub struct LockSegment {
    inner: PlatformSegment,
}

impl LockSegment {
    /// Create a new named segment sized for `num_locks` slots.
    ///
    /// The count is rounded up to a whole number of bitmap words; the
    /// actual capacity is reported by [`num_locks`](Self::num_locks). Fails
    /// if `num_locks` is zero or the name already exists.
    pub fn create(path: &str, num_locks: u32) -> Result<Self> {
        if num_locks == 0 {
            return Err(Error::InvalidNumLocks);
        }
        let inner = PlatformSegment::create(path, num_locks, BITMAP_WORD_BITS)?;
        debug!(
            path = inner.name(),
            num_locks = inner.num_locks(),
            "created lock segment"
        );
        Ok(Self { inner })
    }

    /// Open an existing named segment.
    ///
    /// The slot count is read back from the segment header; `num_locks` is
    /// advisory and only used to flag configuration drift between
    /// processes. Fails if `num_locks` is zero, the segment does not exist,
    /// or the named object is not a lock segment.
    pub fn open(path: &str, num_locks: u32) -> Result<Self> {
        if num_locks == 0 {
            return Err(Error::InvalidNumLocks);
        }
        let inner = PlatformSegment::open(path, BITMAP_WORD_BITS)?;
        let requested = round_up_locks(num_locks, BITMAP_WORD_BITS);
        if requested != inner.num_locks() {
            warn!(
                path = inner.name(),
                requested,
                found = inner.num_locks(),
                "lock segment capacity differs from configured num_locks; using the segment's"
            );
        }
        debug!(
            path = inner.name(),
            num_locks = inner.num_locks(),
            "opened lock segment"
        );
        Ok(Self { inner })
    }

    /// Slot capacity actually available (post-rounding), not the raw
    /// requested count.
    pub fn num_locks(&self) -> u32 {
        self.inner.num_locks()
    }

    /// Reserve the lowest free slot and return its index. Fails with a
    /// capacity error naming the configured limit once every slot is taken.
    pub fn allocate_semaphore(&self) -> Result<u32> {
        let index = self.inner.allocate_semaphore()?;
        trace!(path = self.inner.name(), index, "allocated lock slot");
        Ok(index)
    }

    /// Reserve a specific slot. Fails if the index is out of range or the
    /// slot is already allocated.
    pub fn allocate_given_semaphore(&self, index: u32) -> Result<()> {
        self.inner.allocate_given_semaphore(index)
    }

    /// Return a slot to the free pool. Fails if the index is out of range
    /// or the slot is not allocated.
    pub fn deallocate_semaphore(&self, index: u32) -> Result<()> {
        self.inner.deallocate_semaphore(index)?;
        trace!(path = self.inner.name(), index, "deallocated lock slot");
        Ok(())
    }

    /// Clear the whole allocation bitmap. Bulk cleanup for resets and test
    /// teardown, not part of the normal lifecycle.
    pub fn deallocate_all_semaphores(&self) -> Result<()> {
        warn!(path = self.inner.name(), "deallocating all lock slots");
        self.inner.deallocate_all_semaphores()
    }

    /// Number of currently free slots.
    pub fn available_locks(&self) -> Result<u32> {
        self.inner.available_locks()
    }

    /// Indices of all currently allocated slots, ascending.
    pub fn allocated_indices(&self) -> Result<Vec<u32>> {
        self.inner.allocated_indices()
    }

    /// Block until the slot's mutex is acquired.
    ///
    /// Never checks allocation state, so a handle to a slot that another
    /// process has already freed still locks cleanly. Lock and unlock of
    /// one slot must happen on the same OS thread.
    pub fn lock_semaphore(&self, index: u32) -> Result<()> {
        self.inner.lock_semaphore(index)
    }

    /// Release the slot's mutex. Fails if the calling thread does not hold
    /// it (including double unlock).
    pub fn unlock_semaphore(&self, index: u32) -> Result<()> {
        self.inner.unlock_semaphore(index)
    }

    /// Whether some context currently holds the slot's mutex.
    pub fn semaphore_in_use(&self, index: u32) -> Result<bool> {
        self.inner.semaphore_in_use(index)
    }

    /// Unmap the segment and invalidate this handle. Every later call on it
    /// fails with [`Error::Closed`].
    ///
    /// The named object is not removed; other processes keep using it.
    /// Closing while any process still holds a slot can leave that slot
    /// permanently stuck, so this is a test/teardown operation only.
    pub fn close(&self) -> Result<()> {
        warn!(path = self.inner.name(), "closing lock segment");
        self.inner.close()
    }

    /// Remove a named segment from the system without an open handle.
    /// Best effort; test/teardown helper.
    pub fn unlink_by_name(path: &str) {
        debug!(path, "unlinking lock segment");
        PlatformSegment::unlink_by_name(path);
    }
}
