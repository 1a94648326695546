// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Stub backend for targets without process-shared robust mutexes.
// Mirrors the POSIX backend's surface exactly; both constructors fail, so
// the remaining operations are unreachable but still well-typed.

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct PlatformSegment(());

pub(crate) fn round_up_locks(num_locks: u32, word_bits: u32) -> u32 {
    num_locks.div_ceil(word_bits) * word_bits
}

impl PlatformSegment {
    pub fn create(_path: &str, _num_locks: u32, _word_bits: u32) -> Result<Self> {
        Err(Error::Unsupported)
    }

    pub fn open(_path: &str, _word_bits: u32) -> Result<Self> {
        Err(Error::Unsupported)
    }

    pub fn allocate_semaphore(&self) -> Result<u32> {
        Err(Error::Unsupported)
    }

    pub fn allocate_given_semaphore(&self, _index: u32) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn deallocate_semaphore(&self, _index: u32) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn deallocate_all_semaphores(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn available_locks(&self) -> Result<u32> {
        Err(Error::Unsupported)
    }

    pub fn allocated_indices(&self) -> Result<Vec<u32>> {
        Err(Error::Unsupported)
    }

    pub fn lock_semaphore(&self, _index: u32) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn unlock_semaphore(&self, _index: u32) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn semaphore_in_use(&self, _index: u32) -> Result<bool> {
        Err(Error::Unsupported)
    }

    pub fn num_locks(&self) -> u32 {
        0
    }

    pub fn name(&self) -> &str {
        ""
    }

    pub fn close(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub fn unlink_by_name(_path: &str) {}
}
