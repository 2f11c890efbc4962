// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Windows backend: named kernel mutexes and auto-reset events.

use super::{LockOutcome, NamedEvent, NamedMutex};
use crate::error::{Error, Result};
use std::io;
use std::ptr;
use std::time::Duration;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, WAIT_ABANDONED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, CreateMutexW, OpenEventW, ReleaseMutex, ResetEvent, SetEvent,
    WaitForSingleObject, EVENT_ALL_ACCESS,
};

/// Map a segment-style name (`/peerbus_x`) onto the session-local namespace.
pub(crate) fn kernel_name(name: &str) -> Vec<u16> {
    format!("Local\\{}", name.trim_start_matches('/'))
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect()
}

fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1)
}

fn last_error() -> io::Error {
    // SAFETY: GetLastError has no preconditions.
    io::Error::from_raw_os_error(unsafe { GetLastError() } as i32)
}

pub struct Win32Mutex {
    name: String,
    handle: HANDLE,
}

// SAFETY: kernel handles may be used from any thread.
unsafe impl Send for Win32Mutex {}
unsafe impl Sync for Win32Mutex {}

impl Win32Mutex {
    pub fn open(name: &str) -> Result<Self> {
        let wide = kernel_name(name);
        // SAFETY: `wide` is a null-terminated UTF-16 string.
        let handle = unsafe { CreateMutexW(ptr::null(), 0, wide.as_ptr()) };
        if handle.is_null() {
            return Err(Error::sync(name, last_error()));
        }
        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }
}

impl NamedMutex for Win32Mutex {
    fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self, timeout: Duration) -> Result<LockOutcome> {
        // SAFETY: handle is a live mutex handle.
        let rc = unsafe { WaitForSingleObject(self.handle, timeout_ms(timeout)) };
        match rc {
            WAIT_OBJECT_0 => Ok(LockOutcome::Acquired),
            WAIT_ABANDONED => {
                log::warn!("[sync] Recovered abandoned lock {}", self.name);
                Ok(LockOutcome::AcquiredAfterAbandonment)
            }
            WAIT_TIMEOUT => Ok(LockOutcome::TimedOut),
            _ => Err(Error::sync(&self.name, last_error())),
        }
    }

    fn unlock(&self) {
        // SAFETY: handle is a live mutex handle owned by this thread.
        if unsafe { ReleaseMutex(self.handle) } == 0 {
            log::error!("[sync] Unlock of {} failed: {}", self.name, last_error());
        }
    }
}

impl Drop for Win32Mutex {
    fn drop(&mut self) {
        // SAFETY: handle came from CreateMutexW and is closed once.
        unsafe { CloseHandle(self.handle) };
    }
}

pub struct Win32Event {
    name: String,
    handle: HANDLE,
}

// SAFETY: kernel handles may be used from any thread.
unsafe impl Send for Win32Event {}
unsafe impl Sync for Win32Event {}

impl Win32Event {
    pub fn open(name: &str, create: bool) -> Result<Self> {
        let wide = kernel_name(name);
        // SAFETY: `wide` is a null-terminated UTF-16 string.
        let handle = unsafe {
            if create {
                // auto-reset, initially clear
                CreateEventW(ptr::null(), 0, 0, wide.as_ptr())
            } else {
                OpenEventW(EVENT_ALL_ACCESS, 0, wide.as_ptr())
            }
        };
        if handle.is_null() {
            let err = last_error();
            if !create {
                return Err(Error::NotFound(name.to_string()));
            }
            return Err(Error::sync(name, err));
        }
        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }
}

impl NamedEvent for Win32Event {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal(&self) {
        // SAFETY: handle is a live event handle.
        unsafe { SetEvent(self.handle) };
    }

    fn wait(&self, timeout: Duration) -> bool {
        // SAFETY: handle is a live event handle.
        unsafe { WaitForSingleObject(self.handle, timeout_ms(timeout)) == WAIT_OBJECT_0 }
    }

    fn reset(&self) {
        // SAFETY: handle is a live event handle.
        unsafe { ResetEvent(self.handle) };
    }
}

impl Drop for Win32Event {
    fn drop(&mut self) {
        // SAFETY: handle came from CreateEventW/OpenEventW and is closed once.
        unsafe { CloseHandle(self.handle) };
    }
}
