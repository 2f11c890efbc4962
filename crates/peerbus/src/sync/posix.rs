// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Linux backend: robust pthread mutexes and futex events in shared memory.
//!
//! Each primitive lives in its own tiny shared-memory object so that its
//! name can be opened independently of the data segment it guards.

use super::futex::{futex_wait, futex_wake_all};
use super::{LockOutcome, NamedEvent, NamedMutex};
use crate::error::{Error, Result};
use crate::shm::SharedMemory;
use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const STATE_UNINIT: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_READY: u32 = 2;

/// Bound on waiting for another process to finish initializing a mutex.
const INIT_WAIT: Duration = Duration::from_secs(1);

#[repr(C)]
struct MutexBlock {
    state: AtomicU32,
    _pad: u32,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
}

/// Robust, process-shared pthread mutex.
pub struct PosixMutex {
    name: String,
    block: *mut MutexBlock,
    _region: SharedMemory,
}

// SAFETY: the block is only touched through atomics and pthread calls that
// are designed for concurrent use from any thread or process.
unsafe impl Send for PosixMutex {}
unsafe impl Sync for PosixMutex {}

impl PosixMutex {
    pub fn open(name: &str) -> Result<Self> {
        let (region, _) = SharedMemory::open_or_create(name, mem::size_of::<MutexBlock>())?;
        let block = region.as_ptr().cast::<MutexBlock>();
        let this = Self {
            name: name.to_string(),
            block,
            _region: region,
        };
        this.ensure_initialized()?;
        Ok(this)
    }

    fn block(&self) -> &MutexBlock {
        // SAFETY: the region is page aligned, at least size_of::<MutexBlock>()
        // long and mapped for the lifetime of `self`.
        unsafe { &*self.block }
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.block().mutex.get()
    }

    /// The first opener initializes the pthread mutex; everybody else waits
    /// until the state word says it is ready.
    fn ensure_initialized(&self) -> Result<()> {
        let state = &self.block().state;
        if state
            .compare_exchange(
                STATE_UNINIT,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            // SAFETY: we won the init race, nobody else touches the mutex
            // until STATE_READY is published. `attr` is a local that is
            // initialized before use and destroyed afterwards.
            let rc = unsafe {
                let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
                let mut rc = libc::pthread_mutexattr_init(&mut attr);
                if rc == 0 {
                    rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
                }
                if rc == 0 {
                    rc = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
                }
                if rc == 0 {
                    rc = libc::pthread_mutex_init(self.raw(), &attr);
                }
                libc::pthread_mutexattr_destroy(&mut attr);
                rc
            };
            if rc != 0 {
                state.store(STATE_UNINIT, Ordering::Release);
                return Err(Error::sync(&self.name, io::Error::from_raw_os_error(rc)));
            }
            state.store(STATE_READY, Ordering::Release);
            return Ok(());
        }

        let deadline = Instant::now() + INIT_WAIT;
        while state.load(Ordering::Acquire) != STATE_READY {
            if Instant::now() >= deadline {
                return Err(Error::sync(
                    &self.name,
                    io::Error::new(io::ErrorKind::TimedOut, "mutex initialization stalled"),
                ));
            }
            std::thread::yield_now();
        }
        Ok(())
    }
}

/// Absolute CLOCK_REALTIME deadline `timeout` from now.
fn realtime_deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid out-pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
    }
}

impl NamedMutex for PosixMutex {
    fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self, timeout: Duration) -> Result<LockOutcome> {
        let deadline = realtime_deadline(timeout);
        // SAFETY: the mutex was initialized as process-shared and robust and
        // stays mapped while `self` lives.
        let rc = unsafe { libc::pthread_mutex_timedlock(self.raw(), &deadline) };
        match rc {
            0 => Ok(LockOutcome::Acquired),
            libc::ETIMEDOUT => Ok(LockOutcome::TimedOut),
            libc::EOWNERDEAD => {
                // SAFETY: we own the lock after EOWNERDEAD.
                let rc = unsafe { libc::pthread_mutex_consistent(self.raw()) };
                if rc != 0 {
                    // SAFETY: still the owner; give the lock back before failing.
                    unsafe { libc::pthread_mutex_unlock(self.raw()) };
                    return Err(Error::sync(&self.name, io::Error::from_raw_os_error(rc)));
                }
                log::warn!("[sync] Recovered abandoned lock {}", self.name);
                Ok(LockOutcome::AcquiredAfterAbandonment)
            }
            err => Err(Error::sync(&self.name, io::Error::from_raw_os_error(err))),
        }
    }

    fn unlock(&self) {
        // SAFETY: only called by the owner of a successful lock.
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw()) };
        if rc != 0 {
            log::error!(
                "[sync] Unlock of {} failed: {}",
                self.name,
                io::Error::from_raw_os_error(rc)
            );
        }
    }
}

/// Auto-reset event backed by a futex word.
pub struct PosixEvent {
    name: String,
    word: *const AtomicU32,
    _region: SharedMemory,
}

// SAFETY: the word is only accessed atomically.
unsafe impl Send for PosixEvent {}
unsafe impl Sync for PosixEvent {}

impl PosixEvent {
    pub fn open(name: &str, create: bool) -> Result<Self> {
        let region = if create {
            SharedMemory::open_or_create(name, mem::size_of::<AtomicU32>())?.0
        } else {
            SharedMemory::open_existing(name)?
        };
        if region.len() < mem::size_of::<AtomicU32>() {
            return Err(Error::sync(
                name,
                io::Error::new(io::ErrorKind::InvalidData, "event object too small"),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            word: region.as_ptr().cast::<AtomicU32>(),
            _region: region,
        })
    }

    fn word(&self) -> &AtomicU32 {
        // SAFETY: page-aligned mapping of at least 4 bytes, alive with `self`.
        unsafe { &*self.word }
    }
}

impl NamedEvent for PosixEvent {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal(&self) {
        self.word().store(1, Ordering::Release);
        futex_wake_all(self.word());
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.word().swap(0, Ordering::AcqRel) == 1 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            futex_wait(self.word(), 0, remaining);
        }
    }

    fn reset(&self) {
        self.word().store(0, Ordering::Release);
    }
}
