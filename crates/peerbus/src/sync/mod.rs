// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named cross-process synchronization primitives.
//!
//! Two kinds of object are needed by the data plane:
//!
//! - a **mutex** per segment, guarding its header and payload, which must
//!   report when its previous owner died while holding it;
//! - auto-reset binary **events** per (segment, peer process) pair, one for
//!   "data ready" and one for "acknowledged".
//!
//! ```text
//!   writer process                         reader process (pid 4711)
//!   --------------                         -------------------------
//!   lock  /peerbus_x_100_mtx  <--------->  lock  /peerbus_x_100_mtx
//!   signal /peerbus_x_100_4711_evt  ---->  wait
//!   wait   /peerbus_x_100_4711_ack  <----  signal
//! ```
//!
//! Higher layers only see the [`NamedMutex`] and [`NamedEvent`] traits. The
//! backend is selected at compile time: robust process-shared pthread mutexes
//! plus futex words on Linux, kernel mutex/event objects on Windows.

#[cfg(target_os = "linux")]
mod futex;
#[cfg(target_os = "linux")]
mod posix;
#[cfg(windows)]
mod win32;

#[cfg(windows)]
pub(crate) use win32::kernel_name as kernel_object_name;

#[cfg(not(any(target_os = "linux", windows)))]
compile_error!("peerbus supports Linux and Windows targets only");

use crate::error::Result;
use std::time::Duration;

/// Result of a bounded lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was free or released normally.
    Acquired,
    /// The lock is held, but its previous owner terminated without
    /// releasing it. Data guarded by it may be half-written.
    AcquiredAfterAbandonment,
    /// The deadline passed. Nothing is held.
    TimedOut,
}

impl LockOutcome {
    #[inline]
    pub fn is_acquired(self) -> bool {
        !matches!(self, Self::TimedOut)
    }
}

/// A mutex shared by every process that opens the same name.
pub trait NamedMutex: Send + Sync {
    fn name(&self) -> &str;

    /// Wait at most `timeout` for the lock.
    fn lock(&self, timeout: Duration) -> Result<LockOutcome>;

    /// Release a lock obtained by a successful [`NamedMutex::lock`].
    fn unlock(&self);
}

/// An auto-reset binary event shared by every process that opens the same name.
///
/// Signals do not accumulate: two signals before a wait wake the waiter once.
pub trait NamedEvent: Send + Sync {
    fn name(&self) -> &str;

    /// Set the event and wake a waiter.
    fn signal(&self);

    /// Wait at most `timeout` for the event. Consumes the signal and returns
    /// `true` when it was set, `false` on timeout.
    fn wait(&self, timeout: Duration) -> bool;

    /// Clear a pending signal without waiting.
    fn reset(&self);
}

/// Role of a per-peer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRole {
    DataReady,
    Ack,
}

impl SignalRole {
    fn suffix(self) -> &'static str {
        match self {
            Self::DataReady => "evt",
            Self::Ack => "ack",
        }
    }
}

/// Name of the mutex guarding `segment`.
pub fn mutex_name(segment: &str) -> String {
    format!("{segment}_mtx")
}

/// Name of the event of `role` between `segment` and the peer `process_id`.
pub fn signal_name(segment: &str, process_id: u32, role: SignalRole) -> String {
    format!("{segment}_{process_id}_{}", role.suffix())
}

/// Open the named mutex, creating it on first use.
pub fn open_mutex(name: &str) -> Result<Box<dyn NamedMutex>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(posix::PosixMutex::open(name)?))
    }
    #[cfg(windows)]
    {
        Ok(Box::new(win32::Win32Mutex::open(name)?))
    }
}

/// Open the named event, creating it on first use.
pub fn open_event(name: &str) -> Result<Box<dyn NamedEvent>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(posix::PosixEvent::open(name, true)?))
    }
    #[cfg(windows)]
    {
        Ok(Box::new(win32::Win32Event::open(name, true)?))
    }
}

/// Open the named event only if some other party created it.
pub fn open_existing_event(name: &str) -> Result<Box<dyn NamedEvent>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(posix::PosixEvent::open(name, false)?))
    }
    #[cfg(windows)]
    {
        Ok(Box::new(win32::Win32Event::open(name, false)?))
    }
}

/// Remove the OS name of a mutex. Open handles keep working.
pub fn remove_mutex(name: &str) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        crate::shm::SharedMemory::unlink(name)
    }
    #[cfg(windows)]
    {
        // Kernel objects disappear with their last handle.
        let _ = name;
        Ok(())
    }
}

/// Remove the OS name of an event. Open handles keep working.
pub fn remove_event(name: &str) -> Result<()> {
    remove_mutex(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn unique(prefix: &str) -> String {
        crate::shm::test_name(prefix)
    }

    #[test]
    fn test_names_are_deterministic() {
        assert_eq!(mutex_name("/peerbus_a_1"), "/peerbus_a_1_mtx");
        assert_eq!(
            signal_name("/peerbus_a_1", 42, SignalRole::DataReady),
            "/peerbus_a_1_42_evt"
        );
        assert_eq!(
            signal_name("/peerbus_a_1", 42, SignalRole::Ack),
            "/peerbus_a_1_42_ack"
        );
    }

    #[test]
    fn test_mutex_excludes_second_handle() {
        let name = mutex_name(&unique("mtx"));
        let a = open_mutex(&name).unwrap();
        let b = open_mutex(&name).unwrap();

        assert_eq!(a.lock(Duration::from_millis(50)).unwrap(), LockOutcome::Acquired);

        let contender = thread::spawn(move || {
            let outcome = b.lock(Duration::from_millis(20)).unwrap();
            (outcome, b)
        });
        let (outcome, b) = contender.join().unwrap();
        assert_eq!(outcome, LockOutcome::TimedOut);

        a.unlock();
        assert_eq!(b.lock(Duration::from_millis(50)).unwrap(), LockOutcome::Acquired);
        b.unlock();
        remove_mutex(&name).unwrap();
    }

    #[test]
    fn test_mutex_reports_abandonment() {
        let name = mutex_name(&unique("abandon"));
        let survivor = open_mutex(&name).unwrap();

        let crashed_name = name.clone();
        let crashed = thread::spawn(move || {
            let m = open_mutex(&crashed_name).unwrap();
            assert!(m.lock(Duration::from_millis(50)).unwrap().is_acquired());
            // Thread exits without unlocking; keep the mapping alive.
            m
        });
        let _mapping = crashed.join().unwrap();

        assert_eq!(
            survivor.lock(Duration::from_millis(200)).unwrap(),
            LockOutcome::AcquiredAfterAbandonment
        );
        survivor.unlock();

        // Recovery made the mutex consistent again.
        assert_eq!(
            survivor.lock(Duration::from_millis(50)).unwrap(),
            LockOutcome::Acquired
        );
        survivor.unlock();
        remove_mutex(&name).unwrap();
    }

    #[test]
    fn test_event_is_auto_reset() {
        let name = unique("evt");
        let event = open_event(&name).unwrap();

        event.signal();
        event.signal();
        assert!(event.wait(Duration::from_millis(10)));
        assert!(!event.wait(Duration::from_millis(10)));
        remove_event(&name).unwrap();
    }

    #[test]
    fn test_event_reset_clears_pending_signal() {
        let name = unique("reset");
        let event = open_event(&name).unwrap();
        event.signal();
        event.reset();
        assert!(!event.wait(Duration::from_millis(5)));
        remove_event(&name).unwrap();
    }

    #[test]
    fn test_event_wakes_other_handle() {
        let name = unique("wake");
        let waiter: Arc<dyn NamedEvent> = Arc::from(open_event(&name).unwrap());
        let signaler = open_existing_event(&name).unwrap();

        let w = Arc::clone(&waiter);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            (w.wait(Duration::from_secs(2)), start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        signaler.signal();

        let (woken, elapsed) = handle.join().unwrap();
        assert!(woken);
        assert!(elapsed < Duration::from_secs(1));
        remove_event(&name).unwrap();
    }

    #[test]
    fn test_open_existing_event_requires_creator() {
        let name = unique("missing");
        assert!(open_existing_event(&name).is_err());
    }
}
