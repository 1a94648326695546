// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unit tests for the lock segment: creation, opening, the bitmap
// allocator, and the slot mutex array.

#![cfg(unix)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shmlock::{Error, LockSegment};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_seg_{}_{n}", std::process::id())
}

#[test]
fn create_rejects_zero_locks() {
    let name = unique_name("zero");
    LockSegment::unlink_by_name(&name);

    let err = LockSegment::create(&name, 0).unwrap_err();
    assert!(matches!(err, Error::InvalidNumLocks));
}

#[test]
fn open_rejects_zero_locks() {
    let name = unique_name("zero_open");
    let err = LockSegment::open(&name, 0).unwrap_err();
    assert!(matches!(err, Error::InvalidNumLocks));
}

#[test]
fn create_rounds_up_to_word_multiple() {
    let name = unique_name("round");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 7).expect("create");
    assert_eq!(seg.num_locks(), 32);

    LockSegment::unlink_by_name(&name);
}

#[test]
fn create_keeps_exact_multiple() {
    let name = unique_name("exact");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 128).expect("create");
    assert_eq!(seg.num_locks(), 128);

    LockSegment::unlink_by_name(&name);
}

#[test]
fn create_existing_fails() {
    let name = unique_name("dup");
    LockSegment::unlink_by_name(&name);

    let _seg = LockSegment::create(&name, 32).expect("create");
    let err = LockSegment::create(&name, 32).unwrap_err();
    assert!(matches!(err, Error::Os { op: "shm_open", .. }));

    LockSegment::unlink_by_name(&name);
}

#[test]
fn open_nonexistent_fails_not_found() {
    let name = unique_name("absent");
    LockSegment::unlink_by_name(&name);

    let err = LockSegment::open(&name, 32).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn open_rejects_invalid_path() {
    let err = LockSegment::open("/a/b", 32).unwrap_err();
    assert!(matches!(err, Error::InvalidName { .. }));
}

// The header is authoritative: an open with a different configured count
// still yields the segment's real capacity.
#[cfg(target_os = "linux")]
#[test]
fn open_reads_count_from_header() {
    let name = unique_name("hdr");
    LockSegment::unlink_by_name(&name);

    let created = LockSegment::create(&name, 64).expect("create");
    let opened = LockSegment::open(&name, 32).expect("open");
    assert_eq!(opened.num_locks(), 64);

    drop(opened);
    drop(created);
    LockSegment::unlink_by_name(&name);
}

// A foreign shm object must be rejected by the magic/version check, not
// misinterpreted.
#[test]
fn open_rejects_foreign_shm_object() {
    let name = unique_name("foreign");
    LockSegment::unlink_by_name(&name);

    let c_name = std::ffi::CString::new(format!("/{name}")).expect("cstring");
    let fd = unsafe {
        libc::shm_open(
            c_name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::c_uint,
        )
    };
    assert!(fd >= 0, "shm_open failed");
    unsafe {
        libc::ftruncate(fd, 4096);
        libc::close(fd);
    }

    let err = LockSegment::open(&name, 32).unwrap_err();
    assert!(matches!(err, Error::NotLockSegment { .. }));

    LockSegment::unlink_by_name(&name);
}

#[test]
fn allocate_returns_lowest_free_index() {
    let name = unique_name("lowest");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 32).expect("create");
    for expected in 0..8 {
        let idx = seg.allocate_semaphore().expect("allocate");
        assert_eq!(idx, expected);
    }

    LockSegment::unlink_by_name(&name);
}

#[test]
fn capacity_exhausted_names_the_limit() {
    let name = unique_name("full");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 32).expect("create");
    for _ in 0..32 {
        seg.allocate_semaphore().expect("allocate");
    }
    let err = seg.allocate_semaphore().unwrap_err();
    assert!(matches!(err, Error::CapacityExhausted { limit: 32 }));
    assert!(err.to_string().contains("32"), "message must name the limit");

    LockSegment::unlink_by_name(&name);
}

// Allocate all N, then for each j: deallocate j and reallocate, expecting
// j back every time (lowest-free-index policy).
#[test]
fn deallocate_then_reallocate_reuses_index() {
    let name = unique_name("reuse");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 64).expect("create");
    for _ in 0..64 {
        seg.allocate_semaphore().expect("allocate");
    }
    for j in 0..64 {
        seg.deallocate_semaphore(j).expect("deallocate");
        let idx = seg.allocate_semaphore().expect("reallocate");
        assert_eq!(idx, j);
    }

    LockSegment::unlink_by_name(&name);
}

#[test]
fn allocate_given_reserves_and_rejects_taken() {
    let name = unique_name("given");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 32).expect("create");
    seg.allocate_given_semaphore(5).expect("allocate 5");

    let err = seg.allocate_given_semaphore(5).unwrap_err();
    assert!(matches!(err, Error::AlreadyAllocated { index: 5 }));

    // The general allocator skips the reserved slot's predecessors: 0 is
    // still the lowest free index.
    assert_eq!(seg.allocate_semaphore().expect("allocate"), 0);

    let err = seg.allocate_given_semaphore(32).unwrap_err();
    assert!(matches!(err, Error::IndexOutOfRange { index: 32, max: 32 }));

    LockSegment::unlink_by_name(&name);
}

#[test]
fn deallocate_unallocated_fails() {
    let name = unique_name("dealloc");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 32).expect("create");
    let err = seg.deallocate_semaphore(3).unwrap_err();
    assert!(matches!(err, Error::NotAllocated { index: 3 }));

    let err = seg.deallocate_semaphore(99).unwrap_err();
    assert!(matches!(err, Error::IndexOutOfRange { index: 99, .. }));

    LockSegment::unlink_by_name(&name);
}

#[test]
fn deallocate_all_clears_every_slot() {
    let name = unique_name("dealloc_all");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 64).expect("create");
    for _ in 0..20 {
        seg.allocate_semaphore().expect("allocate");
    }
    assert_eq!(seg.available_locks().expect("available"), 44);

    seg.deallocate_all_semaphores().expect("deallocate all");
    assert_eq!(seg.available_locks().expect("available"), 64);
    assert_eq!(seg.allocate_semaphore().expect("allocate"), 0);

    LockSegment::unlink_by_name(&name);
}

#[test]
fn available_locks_tracks_allocation() {
    let name = unique_name("avail");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 32).expect("create");
    assert_eq!(seg.available_locks().expect("available"), 32);

    let a = seg.allocate_semaphore().expect("allocate");
    let _b = seg.allocate_semaphore().expect("allocate");
    assert_eq!(seg.available_locks().expect("available"), 30);

    seg.deallocate_semaphore(a).expect("deallocate");
    assert_eq!(seg.available_locks().expect("available"), 31);

    LockSegment::unlink_by_name(&name);
}

#[test]
fn allocated_indices_ascending() {
    let name = unique_name("indices");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 64).expect("create");
    seg.allocate_given_semaphore(40).expect("allocate 40");
    seg.allocate_given_semaphore(2).expect("allocate 2");
    seg.allocate_given_semaphore(33).expect("allocate 33");

    assert_eq!(seg.allocated_indices().expect("indices"), vec![2, 33, 40]);

    LockSegment::unlink_by_name(&name);
}

// Locking is deliberately independent of allocation: a slot that was never
// allocated (or was freed by another process) must still lock and unlock
// without error.
#[test]
fn lock_unlock_unallocated_slot() {
    let name = unique_name("unalloc_lock");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 32).expect("create");
    seg.lock_semaphore(17).expect("lock unallocated");
    seg.unlock_semaphore(17).expect("unlock unallocated");

    LockSegment::unlink_by_name(&name);
}

#[test]
fn lock_out_of_range_fails() {
    let name = unique_name("range");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 32).expect("create");
    assert!(matches!(
        seg.lock_semaphore(32).unwrap_err(),
        Error::IndexOutOfRange { index: 32, max: 32 }
    ));
    assert!(matches!(
        seg.unlock_semaphore(100).unwrap_err(),
        Error::IndexOutOfRange { index: 100, .. }
    ));

    LockSegment::unlink_by_name(&name);
}

// Robust mutexes track ownership; a second unlock without an intervening
// lock must fail. macOS lacks robust mutexes and cannot detect this.
#[cfg(not(target_os = "macos"))]
#[test]
fn double_unlock_fails() {
    let name = unique_name("double_unlock");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 32).expect("create");
    seg.lock_semaphore(4).expect("lock");
    seg.unlock_semaphore(4).expect("unlock");

    let err = seg.unlock_semaphore(4).unwrap_err();
    assert!(matches!(err, Error::NotLocked { index: 4 }));

    LockSegment::unlink_by_name(&name);
}

#[cfg(not(target_os = "macos"))]
#[test]
fn unlock_never_locked_fails() {
    let name = unique_name("never_locked");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 32).expect("create");
    let err = seg.unlock_semaphore(9).unwrap_err();
    assert!(matches!(err, Error::NotLocked { index: 9 }));

    LockSegment::unlink_by_name(&name);
}

#[test]
fn semaphore_in_use_reflects_lock_state() {
    let name = unique_name("in_use");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 32).expect("create");
    assert!(!seg.semaphore_in_use(6).expect("probe"));

    seg.lock_semaphore(6).expect("lock");
    assert!(seg.semaphore_in_use(6).expect("probe held"));

    seg.unlock_semaphore(6).expect("unlock");
    assert!(!seg.semaphore_in_use(6).expect("probe released"));

    LockSegment::unlink_by_name(&name);
}

#[test]
fn close_invalidates_handle() {
    let name = unique_name("close");
    LockSegment::unlink_by_name(&name);

    let seg = LockSegment::create(&name, 32).expect("create");
    seg.close().expect("close");

    assert!(matches!(seg.allocate_semaphore().unwrap_err(), Error::Closed));
    assert!(matches!(seg.lock_semaphore(0).unwrap_err(), Error::Closed));
    assert!(matches!(seg.close().unwrap_err(), Error::Closed));

    LockSegment::unlink_by_name(&name);
}

// Two threads contending on one slot: the second acquisition must happen
// only after the first holder releases.
#[test]
fn contended_lock_blocks_until_release() {
    let name = unique_name("contend");
    LockSegment::unlink_by_name(&name);

    let seg = Arc::new(LockSegment::create(&name, 32).expect("create"));
    let released = Arc::new(AtomicBool::new(false));

    seg.lock_semaphore(5).expect("lock main");

    let seg_t = Arc::clone(&seg);
    let released_t = Arc::clone(&released);
    let waiter = thread::spawn(move || {
        let start = Instant::now();
        seg_t.lock_semaphore(5).expect("lock thread");
        let waited = start.elapsed();
        assert!(
            released_t.load(Ordering::SeqCst),
            "acquired the lock before the holder released it"
        );
        seg_t.unlock_semaphore(5).expect("unlock thread");
        waited
    });

    thread::sleep(Duration::from_millis(100));
    released.store(true, Ordering::SeqCst);
    seg.unlock_semaphore(5).expect("unlock main");

    let waited = waiter.join().expect("join");
    assert!(waited >= Duration::from_millis(50), "waiter did not block");

    LockSegment::unlink_by_name(&name);
}

// Many threads hammering the allocator must never hand out one index
// twice.
#[test]
fn concurrent_allocation_is_unique() {
    let name = unique_name("concurrent_alloc");
    LockSegment::unlink_by_name(&name);

    let seg = Arc::new(LockSegment::create(&name, 128).expect("create"));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let seg = Arc::clone(&seg);
            thread::spawn(move || {
                let mut got = Vec::new();
                for _ in 0..32 {
                    got.push(seg.allocate_semaphore().expect("allocate"));
                }
                got
            })
        })
        .collect();

    let mut all: Vec<u32> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("join"))
        .collect();
    all.sort_unstable();
    let expected: Vec<u32> = (0..128).collect();
    assert_eq!(all, expected);

    LockSegment::unlink_by_name(&name);
}
