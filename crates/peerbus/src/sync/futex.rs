// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Futex syscall wrappers for event words living in shared memory.
//!
//! Only the SHARED operations are used (`FUTEX_WAIT` = 0, `FUTEX_WAKE` = 1).
//! The `_PRIVATE` variants key the wait queue on the process address space
//! and would never wake a waiter in another process.

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

const FUTEX_WAIT: i32 = 0;
const FUTEX_WAKE: i32 = 1;

/// Block while `*word == expected`, for at most `timeout`.
///
/// Returns 0 on wake (or spurious wake), -1 with `EAGAIN` when the value
/// already differs and -1 with `ETIMEDOUT` when the relative timeout elapsed.
/// Callers always re-check the word afterwards.
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) -> i32 {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };

    // SAFETY: `word` is a live reference for the duration of the call and
    // `ts` outlives the syscall. FUTEX_WAIT reads the word atomically.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake up to `count` waiters blocked on `word`.
pub fn futex_wake(word: &AtomicU32, count: i32) -> i32 {
    // SAFETY: FUTEX_WAKE only uses the address as a wait-queue key.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake every waiter.
#[inline]
pub fn futex_wake_all(word: &AtomicU32) -> i32 {
    futex_wake(word, i32::MAX)
}
