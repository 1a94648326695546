// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX backend: the shared region layout and every syscall live here.
//
// Region layout, all offsets computed with plain arithmetic (no struct
// casts), version-gated by the header:
//
//   [0]   u32 magic
//   [4]   u32 layout version
//   [8]   u32 num_locks   (always a whole number of bitmap words)
//   [12]  u32 num_words
//   [pad to mutex alignment]
//   [..]  pthread_mutex_t segment_lock   — guards all bitmap mutation
//   [..]  u32 bitmap[num_words]          — bit i set ⇔ slot i allocated
//   [pad to mutex alignment]
//   [..]  pthread_mutex_t slots[num_locks]
//
// All mutexes are PTHREAD_PROCESS_SHARED + PTHREAD_MUTEX_ROBUST with
// NORMAL type, so recursive locking by one thread blocks instead of
// succeeding, and a holder that dies leaves the mutex recoverable via
// EOWNERDEAD + pthread_mutex_consistent.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::shm_name;

/// Identifies a mapped region as a lock segment.
const SEGMENT_MAGIC: u32 = 0x4c6f_634b;

/// Bumped whenever the region layout changes incompatibly (including any
/// change to the bitmap word width).
const LAYOUT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Robust mutex symbols — not exposed by the libc crate on all platforms.
// macOS has no robust mutexes; dead-holder recovery and unlock-ownership
// checks are unavailable there.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// Layout arithmetic
// ---------------------------------------------------------------------------

const HDR_MAGIC: usize = 0;
const HDR_VERSION: usize = 4;
const HDR_NUM_LOCKS: usize = 8;
const HDR_NUM_WORDS: usize = 12;
const HDR_FIXED_END: usize = 16;

const fn align_up(off: usize, align: usize) -> usize {
    (off + align - 1) & !(align - 1)
}

fn mutex_size() -> usize {
    std::mem::size_of::<libc::pthread_mutex_t>()
}

fn mutex_align() -> usize {
    // The header fields are u32-aligned; mutexes may need more.
    std::mem::align_of::<libc::pthread_mutex_t>().max(std::mem::align_of::<u32>())
}

fn segment_lock_offset() -> usize {
    align_up(HDR_FIXED_END, mutex_align())
}

fn bitmap_offset() -> usize {
    align_up(
        segment_lock_offset() + mutex_size(),
        std::mem::align_of::<u32>(),
    )
}

fn slots_offset(num_words: u32) -> usize {
    align_up(
        bitmap_offset() + num_words as usize * std::mem::size_of::<u32>(),
        mutex_align(),
    )
}

fn segment_size(num_locks: u32, num_words: u32) -> usize {
    slots_offset(num_words) + num_locks as usize * mutex_size()
}

/// Round a requested lock count up to a whole number of bitmap words.
/// Zero is rejected by the caller before this point.
pub(crate) fn round_up_locks(num_locks: u32, word_bits: u32) -> u32 {
    num_locks.div_ceil(word_bits) * word_bits
}

// ---------------------------------------------------------------------------
// Mutex helpers — shared by the segment lock and the slot array
// ---------------------------------------------------------------------------

/// Take a mutex, blocking unless `trylock`. Returns `Ok(false)` only for a
/// contended trylock.
///
/// A mutex whose previous holder died (EOWNERDEAD) is marked consistent and
/// taken; the slot's logical allocation state is untouched by the crash.
///
/// # Safety
/// `mutex` must point to an initialised process-shared mutex inside a live
/// mapping.
unsafe fn take_mutex(mutex: *mut libc::pthread_mutex_t, trylock: bool) -> io::Result<bool> {
    loop {
        let eno = if trylock {
            libc::pthread_mutex_trylock(mutex)
        } else {
            libc::pthread_mutex_lock(mutex)
        };
        match eno {
            0 => return Ok(true),
            libc::EAGAIN => continue,
            libc::EBUSY if trylock => return Ok(false),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => {
                let eno2 = pthread_mutex_consistent(mutex);
                if eno2 != 0 {
                    // Someone else may have beaten us to marking it
                    // consistent, or the mutex is unusable. Surface the
                    // error rather than retrying the lock.
                    return Err(io::Error::from_raw_os_error(eno2));
                }
                return Ok(true);
            }
            _ => return Err(io::Error::from_raw_os_error(eno)),
        }
    }
}

/// Release a mutex. EPERM (not owned by the calling thread) is left for the
/// caller to translate.
///
/// # Safety
/// Same contract as [`take_mutex`].
unsafe fn release_mutex(mutex: *mut libc::pthread_mutex_t) -> io::Result<()> {
    loop {
        let eno = libc::pthread_mutex_unlock(mutex);
        match eno {
            0 => return Ok(()),
            libc::EAGAIN => continue,
            _ => return Err(io::Error::from_raw_os_error(eno)),
        }
    }
}

fn cstring(name: &str) -> Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| Error::InvalidName {
        name: name.to_string(),
        reason: "name must not contain NUL bytes",
    })
}

fn os_err(op: &'static str, path: &str, source: io::Error) -> Error {
    Error::Os {
        op,
        path: path.to_string(),
        source,
    }
}

// ---------------------------------------------------------------------------
// PlatformSegment
// ---------------------------------------------------------------------------

/// The POSIX lock segment: a named shm object mapped into this process.
#[derive(Debug)]
pub struct PlatformSegment {
    mem: *mut u8,
    size: usize,
    num_locks: u32,
    num_words: u32,
    word_bits: u32,
    name: String,
    unmapped: AtomicBool,
}

// Safety: the mapping is process-shared by design; all mutation of shared
// state goes through process-shared mutexes or the atomic `unmapped` flag.
unsafe impl Send for PlatformSegment {}
unsafe impl Sync for PlatformSegment {}

impl PlatformSegment {
    /// Create a new named segment sized for `num_locks` slots (rounded up
    /// to a whole number of bitmap words) and initialise header, bitmap and
    /// every mutex. Fails if the name already exists.
    pub fn create(path: &str, num_locks: u32, word_bits: u32) -> Result<Self> {
        let name = shm_name::normalize(path)?;
        let c_name = cstring(&name)?;

        let num_locks = round_up_locks(num_locks, word_bits);
        let num_words = num_locks / word_bits;
        let size = segment_size(num_locks, num_words);

        let perms: libc::mode_t = 0o600;
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                perms as libc::c_uint,
            )
        };
        if fd == -1 {
            return Err(os_err("shm_open", &name, io::Error::last_os_error()));
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(os_err("ftruncate", &name, err));
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(os_err("mmap", &name, err));
        }

        let seg = Self {
            mem: mem as *mut u8,
            size,
            num_locks,
            num_words,
            word_bits,
            name,
            unmapped: AtomicBool::new(false),
        };

        if let Err(e) = seg.init_region() {
            // A partly initialised segment must never be reopened.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(e);
        }
        Ok(seg)
    }

    /// Map an existing named segment. The slot count comes from the header,
    /// never from the caller; magic, version and size are validated before
    /// the full region is mapped.
    pub fn open(path: &str, word_bits: u32) -> Result<Self> {
        let name = shm_name::normalize(path)?;
        let c_name = cstring(&name)?;

        let perms: libc::mode_t = 0o600;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
        if fd == -1 {
            return Err(os_err("shm_open", &name, io::Error::last_os_error()));
        }

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(os_err("fstat", &name, err));
        }
        if (st.st_size as u64) < HDR_FIXED_END as u64 {
            unsafe { libc::close(fd) };
            return Err(Error::NotLockSegment { path: name });
        }

        // Map just the header first; the full mapping size is only known
        // once num_locks has been read back.
        let hdr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                HDR_FIXED_END,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if hdr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(os_err("mmap", &name, err));
        }
        let (magic, version, num_locks, num_words) = unsafe {
            let base = hdr as *const u8;
            (
                ptr::read(base.add(HDR_MAGIC) as *const u32),
                ptr::read(base.add(HDR_VERSION) as *const u32),
                ptr::read(base.add(HDR_NUM_LOCKS) as *const u32),
                ptr::read(base.add(HDR_NUM_WORDS) as *const u32),
            )
        };
        unsafe { libc::munmap(hdr, HDR_FIXED_END) };

        let header_sane = magic == SEGMENT_MAGIC
            && version == LAYOUT_VERSION
            && num_words != 0
            && num_words == num_locks / word_bits
            && num_locks % word_bits == 0;
        if !header_sane {
            unsafe { libc::close(fd) };
            return Err(Error::NotLockSegment { path: name });
        }
        let size = segment_size(num_locks, num_words);
        if (st.st_size as u64) < size as u64 {
            unsafe { libc::close(fd) };
            return Err(Error::NotLockSegment { path: name });
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(os_err("mmap", &name, io::Error::last_os_error()));
        }

        Ok(Self {
            mem: mem as *mut u8,
            size,
            num_locks,
            num_words,
            word_bits,
            name,
            unmapped: AtomicBool::new(false),
        })
    }

    /// Initialise header, bitmap and all mutexes of a freshly created
    /// region. Runs exactly once, before any other process can open the
    /// segment (creation is exclusive).
    fn init_region(&self) -> Result<()> {
        unsafe {
            self.write_header_u32(HDR_MAGIC, SEGMENT_MAGIC);
            self.write_header_u32(HDR_VERSION, LAYOUT_VERSION);
            self.write_header_u32(HDR_NUM_LOCKS, self.num_locks);
            self.write_header_u32(HDR_NUM_WORDS, self.num_words);

            for w in 0..self.num_words {
                *self.word_ptr(w) = 0;
            }

            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            let mut eno = libc::pthread_mutexattr_init(&mut attr);
            if eno != 0 {
                return Err(self.errno("pthread_mutexattr_init", eno));
            }

            // Recursive locking of one slot by the same thread must block.
            eno = libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_NORMAL);
            if eno != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(self.errno("pthread_mutexattr_settype", eno));
            }

            eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if eno != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(self.errno("pthread_mutexattr_setpshared", eno));
            }

            #[cfg(not(target_os = "macos"))]
            {
                eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
                if eno != 0 {
                    libc::pthread_mutexattr_destroy(&mut attr);
                    return Err(self.errno("pthread_mutexattr_setrobust", eno));
                }
            }

            eno = libc::pthread_mutex_init(self.segment_lock(), &attr);
            let mut i = 0;
            while eno == 0 && i < self.num_locks {
                eno = libc::pthread_mutex_init(self.slot_ptr(i), &attr);
                i += 1;
            }
            libc::pthread_mutexattr_destroy(&mut attr);
            if eno != 0 {
                return Err(self.errno("pthread_mutex_init", eno));
            }
        }
        Ok(())
    }

    // -- accessors ----------------------------------------------------------

    fn check_open(&self) -> Result<()> {
        if self.unmapped.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.num_locks {
            Err(Error::IndexOutOfRange {
                index,
                max: self.num_locks,
            })
        } else {
            Ok(())
        }
    }

    unsafe fn write_header_u32(&self, offset: usize, val: u32) {
        ptr::write(self.mem.add(offset) as *mut u32, val);
    }

    fn segment_lock(&self) -> *mut libc::pthread_mutex_t {
        unsafe { self.mem.add(segment_lock_offset()) as *mut libc::pthread_mutex_t }
    }

    unsafe fn word_ptr(&self, word: u32) -> *mut u32 {
        self.mem
            .add(bitmap_offset() + word as usize * std::mem::size_of::<u32>())
            as *mut u32
    }

    fn slot_ptr(&self, index: u32) -> *mut libc::pthread_mutex_t {
        unsafe {
            self.mem
                .add(slots_offset(self.num_words) + index as usize * mutex_size())
                as *mut libc::pthread_mutex_t
        }
    }

    fn word_mask(&self, index: u32) -> (u32, u32) {
        (index / self.word_bits, 1 << (index % self.word_bits))
    }

    fn errno(&self, op: &'static str, eno: i32) -> Error {
        self.os(op, io::Error::from_raw_os_error(eno))
    }

    fn os(&self, op: &'static str, source: io::Error) -> Error {
        Error::Os {
            op,
            path: self.name.clone(),
            source,
        }
    }

    /// Run `f` with the segment lock held. Bitmap words are plain (not
    /// atomic) because every read-modify-write happens under this mutex.
    fn with_segment_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        unsafe { take_mutex(self.segment_lock(), false) }
            .map_err(|e| self.os("pthread_mutex_lock", e))?;
        let out = f();
        match unsafe { release_mutex(self.segment_lock()) } {
            Ok(()) => out,
            Err(e) => Err(self.os("pthread_mutex_unlock", e)),
        }
    }

    // -- bitmap allocator ---------------------------------------------------

    /// Reserve the lowest free slot and return its index.
    pub fn allocate_semaphore(&self) -> Result<u32> {
        self.check_open()?;
        self.with_segment_lock(|| {
            for w in 0..self.num_words {
                let word = unsafe { *self.word_ptr(w) };
                if word == u32::MAX {
                    continue;
                }
                let bit = (!word).trailing_zeros();
                unsafe { *self.word_ptr(w) = word | (1 << bit) };
                return Ok(w * self.word_bits + bit);
            }
            Err(Error::CapacityExhausted {
                limit: self.num_locks,
            })
        })
    }

    /// Reserve one specific slot.
    pub fn allocate_given_semaphore(&self, index: u32) -> Result<()> {
        self.check_open()?;
        self.check_index(index)?;
        let (w, mask) = self.word_mask(index);
        self.with_segment_lock(|| {
            let word = unsafe { *self.word_ptr(w) };
            if word & mask != 0 {
                return Err(Error::AlreadyAllocated { index });
            }
            unsafe { *self.word_ptr(w) = word | mask };
            Ok(())
        })
    }

    /// Return a slot to the free pool. The slot's mutex state is untouched.
    pub fn deallocate_semaphore(&self, index: u32) -> Result<()> {
        self.check_open()?;
        self.check_index(index)?;
        let (w, mask) = self.word_mask(index);
        self.with_segment_lock(|| {
            let word = unsafe { *self.word_ptr(w) };
            if word & mask == 0 {
                return Err(Error::NotAllocated { index });
            }
            unsafe { *self.word_ptr(w) = word & !mask };
            Ok(())
        })
    }

    /// Clear the whole bitmap. Bulk cleanup only, not part of the normal
    /// lifecycle.
    pub fn deallocate_all_semaphores(&self) -> Result<()> {
        self.check_open()?;
        self.with_segment_lock(|| {
            for w in 0..self.num_words {
                unsafe { *self.word_ptr(w) = 0 };
            }
            Ok(())
        })
    }

    /// Number of free slots.
    pub fn available_locks(&self) -> Result<u32> {
        self.check_open()?;
        self.with_segment_lock(|| {
            let mut free = 0;
            for w in 0..self.num_words {
                free += unsafe { *self.word_ptr(w) }.count_zeros();
            }
            Ok(free)
        })
    }

    /// Indices of all currently allocated slots, in ascending order.
    pub fn allocated_indices(&self) -> Result<Vec<u32>> {
        self.check_open()?;
        self.with_segment_lock(|| {
            let mut out = Vec::new();
            for w in 0..self.num_words {
                let mut word = unsafe { *self.word_ptr(w) };
                while word != 0 {
                    let bit = word.trailing_zeros();
                    out.push(w * self.word_bits + bit);
                    word &= !(1 << bit);
                }
            }
            Ok(out)
        })
    }

    // -- slot array ---------------------------------------------------------

    /// Block until the slot mutex is acquired. Deliberately never consults
    /// the bitmap: a slot freed (or never allocated) by another process must
    /// still lock cleanly so stale handle holders can observe the removal.
    pub fn lock_semaphore(&self, index: u32) -> Result<()> {
        self.check_open()?;
        self.check_index(index)?;
        unsafe { take_mutex(self.slot_ptr(index), false) }
            .map(|_| ())
            .map_err(|e| self.os("pthread_mutex_lock", e))
    }

    /// Release the slot mutex. Must be called on the thread that locked it.
    pub fn unlock_semaphore(&self, index: u32) -> Result<()> {
        self.check_open()?;
        self.check_index(index)?;
        match unsafe { release_mutex(self.slot_ptr(index)) } {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => Err(Error::NotLocked { index }),
            Err(e) => Err(self.os("pthread_mutex_unlock", e)),
        }
    }

    /// Whether some context currently holds the slot. Probes with a trylock
    /// that is released immediately when it succeeds.
    pub fn semaphore_in_use(&self, index: u32) -> Result<bool> {
        self.check_open()?;
        self.check_index(index)?;
        let mutex = self.slot_ptr(index);
        let taken =
            unsafe { take_mutex(mutex, true) }.map_err(|e| self.os("pthread_mutex_trylock", e))?;
        if !taken {
            return Ok(true);
        }
        unsafe { release_mutex(mutex) }.map_err(|e| self.os("pthread_mutex_unlock", e))?;
        Ok(false)
    }

    // -- handle lifecycle ---------------------------------------------------

    /// Slot capacity, post-rounding.
    pub fn num_locks(&self) -> u32 {
        self.num_locks
    }

    /// The normalised POSIX name of the segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unmap the region and invalidate this handle. The named object stays
    /// in place for other processes.
    pub fn close(&self) -> Result<()> {
        if self.unmapped.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        if unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) } != 0 {
            return Err(self.os("munmap", io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Remove a named segment without an open handle. Best effort.
    pub fn unlink_by_name(path: &str) {
        if let Ok(name) = shm_name::normalize(path) {
            if let Ok(c_name) = cstring(&name) {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
        }
    }
}

impl Drop for PlatformSegment {
    fn drop(&mut self) {
        if !self.unmapped.swap(true, Ordering::AcqRel) {
            unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_whole_words() {
        assert_eq!(round_up_locks(1, 32), 32);
        assert_eq!(round_up_locks(7, 32), 32);
        assert_eq!(round_up_locks(32, 32), 32);
        assert_eq!(round_up_locks(33, 32), 64);
        assert_eq!(round_up_locks(2048, 32), 2048);
    }

    #[test]
    fn layout_offsets_aligned() {
        let ma = mutex_align();
        assert_eq!(segment_lock_offset() % ma, 0);
        assert_eq!(bitmap_offset() % std::mem::align_of::<u32>(), 0);
        assert_eq!(slots_offset(4) % ma, 0);
        assert!(bitmap_offset() >= segment_lock_offset() + mutex_size());
    }

    #[test]
    fn segment_size_scales_with_locks() {
        let small = segment_size(32, 1);
        let large = segment_size(64, 2);
        assert!(large > small);
        assert_eq!(large - segment_size(32, 2), 32 * mutex_size());
    }
}
