// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named shared-memory regions.
//!
//! On Linux a region is a POSIX shared memory object (`shm_open` + `mmap`).
//! The file descriptor stays open so the region can be grown in place and
//! other openers can remap after observing a larger size.
//!
//! On Windows a region is a pagefile-backed file mapping. Mappings cannot be
//! resized there, so growth beyond the initial size fails with `MapError`.

use crate::error::{Error, Result};
use std::io;

/// Validate a region name: a leading `/`, no other `/`, at most 255 bytes.
pub fn validate_name(name: &str) -> Result<()> {
    if !name.starts_with('/') {
        return Err(Error::InvalidName(format!("{name}: must start with '/'")));
    }
    if name[1..].contains('/') {
        return Err(Error::InvalidName(format!("{name}: '/' after prefix")));
    }
    if name.len() > super::MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "{name}: longer than {} bytes",
            super::MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// A mapped, named shared-memory region.
pub struct SharedMemory {
    ptr: *mut u8,
    len: usize,
    name: String,
    #[cfg(unix)]
    fd: libc::c_int,
    #[cfg(windows)]
    handle: windows_sys::Win32::Foundation::HANDLE,
}

// SAFETY: the mapping is plain shared memory. Concurrent access to its
// contents is coordinated by the named mutex of the owning segment.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The whole mapping as a byte slice.
    ///
    /// # Safety
    ///
    /// Other processes may write concurrently; the caller must hold the
    /// lock that serializes access to this region.
    pub unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    /// The whole mapping as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedMemory::bytes`], and no other reference into
    /// the mapping may be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

#[cfg(unix)]
impl SharedMemory {
    /// Open `name`, creating it with at least `len` bytes if it does not
    /// exist. Returns the region and whether this call created it.
    ///
    /// An existing object smaller than `len` is extended; objects are never
    /// shrunk, so concurrent openers cannot truncate each other's mappings.
    pub fn open_or_create(name: &str, len: usize) -> Result<(Self, bool)> {
        validate_name(name)?;
        let c_name = c_name(name)?;

        // SAFETY: c_name is a valid C string; O_EXCL makes creation atomic.
        let mut fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        let mut created = true;
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(Error::map(name, err));
            }
            // SAFETY: as above, opening an existing object.
            fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
            if fd < 0 {
                return Err(Error::map(name, io::Error::last_os_error()));
            }
            created = false;
        }

        let result: Result<(*mut u8, usize)> = (|| {
            let mapped = extend(fd, len).map_err(|e| Error::map(name, e))?;
            let ptr = map(fd, mapped).map_err(|e| Error::map(name, e))?;
            Ok((ptr, mapped))
        })();

        match result {
            Ok((ptr, mapped)) => Ok((
                Self {
                    ptr,
                    len: mapped,
                    name: name.to_string(),
                    fd,
                },
                created,
            )),
            Err(e) => {
                // SAFETY: fd is open and not used afterwards.
                unsafe { libc::close(fd) };
                if created {
                    let _ = Self::unlink(name);
                }
                Err(e)
            }
        }
    }

    /// Open an existing region and map its full current size.
    pub fn open_existing(name: &str) -> Result<Self> {
        validate_name(name)?;
        let c_name = c_name(name)?;

        // SAFETY: c_name is a valid C string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(Error::NotFound(name.to_string()));
            }
            return Err(Error::map(name, err));
        }

        let result = file_len(fd).and_then(|len| {
            if len == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "region not sized yet",
                ));
            }
            map(fd, len).map(|ptr| (ptr, len))
        });
        match result {
            Ok((ptr, len)) => Ok(Self {
                ptr,
                len,
                name: name.to_string(),
                fd,
            }),
            Err(e) => {
                // SAFETY: fd is open and not used afterwards.
                unsafe { libc::close(fd) };
                Err(Error::map(name, e))
            }
        }
    }

    /// Extend the backing object to at least `len` bytes and remap.
    pub fn grow(&mut self, len: usize) -> Result<()> {
        let current = extend(self.fd, len).map_err(|e| Error::map(&self.name, e))?;
        self.remap(current)
    }

    /// Whether the name now refers to a different object than the one
    /// mapped here (unlinked, or unlinked and created again).
    pub fn is_replaced(&self) -> bool {
        let Ok(mapped) = file_id(self.fd) else {
            return false;
        };
        let Ok(c_name) = c_name(&self.name) else {
            return false;
        };
        // SAFETY: c_name is a valid C string; fd is closed right away.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return io::Error::last_os_error().kind() == io::ErrorKind::NotFound;
        }
        let current = file_id(fd);
        // SAFETY: fd was opened above and is not used afterwards.
        unsafe { libc::close(fd) };
        current.is_ok_and(|id| id != mapped)
    }

    /// Remap if another process grew the backing object. Returns `true`
    /// when the mapping changed.
    pub fn refresh(&mut self) -> Result<bool> {
        let current = file_len(self.fd).map_err(|e| Error::map(&self.name, e))?;
        if current <= self.len {
            return Ok(false);
        }
        self.remap(current)?;
        Ok(true)
    }

    fn remap(&mut self, len: usize) -> Result<()> {
        if len == self.len {
            return Ok(());
        }
        let ptr = map(self.fd, len).map_err(|e| Error::map(&self.name, e))?;
        // SAFETY: the old mapping came from mmap with exactly `self.len`
        // bytes and no reference into it outlives this call (callers hold
        // the region exclusively).
        unsafe { libc::munmap(self.ptr.cast(), self.len) };
        self.ptr = ptr;
        self.len = len;
        Ok(())
    }

    /// Remove the OS name. Existing mappings stay valid; a missing name is fine.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is a valid C string; only the namespace is affected.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(Error::map(name, err));
            }
        }
        Ok(())
    }

    /// Whether a region with this name currently exists.
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = c_name(name) else {
            return false;
        };
        // SAFETY: c_name is a valid C string; fd is closed right away.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }
}

#[cfg(unix)]
fn c_name(name: &str) -> Result<std::ffi::CString> {
    std::ffi::CString::new(name).map_err(|_| Error::InvalidName(name.to_string()))
}

#[cfg(unix)]
fn file_len(fd: libc::c_int) -> io::Result<usize> {
    // SAFETY: `st` is a valid out-pointer and fd is open.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.st_size as usize)
}

#[cfg(unix)]
fn file_id(fd: libc::c_int) -> io::Result<(u64, u64)> {
    // SAFETY: `st` is a valid out-pointer and fd is open.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((st.st_dev as u64, st.st_ino as u64))
}

/// Make the object at least `len` bytes long and return its size.
///
/// `posix_fallocate` only ever extends, so concurrent openers asking for
/// different sizes cannot shrink each other's mappings.
#[cfg(unix)]
fn extend(fd: libc::c_int, len: usize) -> io::Result<usize> {
    let current = file_len(fd)?;
    if current >= len {
        return Ok(current);
    }
    // SAFETY: fd is open for writing; new bytes read as zero.
    let rc = unsafe { libc::posix_fallocate(fd, 0, len as libc::off_t) };
    match rc {
        0 => {}
        libc::EOPNOTSUPP | libc::EINVAL => {
            // Filesystems without fallocate: extend only if still short.
            if file_len(fd)? < len && unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        errno => return Err(io::Error::from_raw_os_error(errno)),
    }
    file_len(fd)
}

#[cfg(unix)]
fn map(fd: libc::c_int, len: usize) -> io::Result<*mut u8> {
    // SAFETY: kernel-chosen address, shared read/write mapping of an open fd.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr.cast())
}

#[cfg(unix)]
impl Drop for SharedMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe our own live mapping and fd is still open.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
            libc::close(self.fd);
        }
    }
}

#[cfg(windows)]
impl SharedMemory {
    pub fn open_or_create(name: &str, len: usize) -> Result<(Self, bool)> {
        use windows_sys::Win32::Foundation::{
            CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, INVALID_HANDLE_VALUE,
        };
        use windows_sys::Win32::System::Memory::{CreateFileMappingW, PAGE_READWRITE};

        validate_name(name)?;
        let wide = crate::sync::kernel_object_name(name);
        // SAFETY: pagefile-backed mapping; wide is null-terminated.
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE,
                (len as u64 >> 32) as u32,
                len as u32,
                wide.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(Error::map(name, io::Error::last_os_error()));
        }
        // SAFETY: GetLastError is always safe to call.
        let created = unsafe { GetLastError() } != ERROR_ALREADY_EXISTS;
        match Self::view(name, handle) {
            Ok(region) if region.len >= len => Ok((region, created)),
            Ok(region) => Err(Error::map(
                &region.name,
                io::Error::new(io::ErrorKind::Unsupported, "existing mapping is smaller"),
            )),
            Err(e) => {
                // SAFETY: handle is open and not used afterwards.
                unsafe { CloseHandle(handle) };
                Err(e)
            }
        }
    }

    pub fn open_existing(name: &str) -> Result<Self> {
        use windows_sys::Win32::System::Memory::{OpenFileMappingW, FILE_MAP_ALL_ACCESS};

        validate_name(name)?;
        let wide = crate::sync::kernel_object_name(name);
        // SAFETY: wide is null-terminated.
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wide.as_ptr()) };
        if handle.is_null() {
            return Err(Error::NotFound(name.to_string()));
        }
        Self::view(name, handle)
    }

    fn view(name: &str, handle: windows_sys::Win32::Foundation::HANDLE) -> Result<Self> {
        use windows_sys::Win32::System::Memory::{
            MapViewOfFile, VirtualQuery, FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION,
        };

        // SAFETY: handle is a live file mapping; length 0 maps all of it.
        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if view.Value.is_null() {
            return Err(Error::map(name, io::Error::last_os_error()));
        }
        // SAFETY: `info` is a valid out-pointer for the queried view.
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        unsafe {
            VirtualQuery(
                view.Value,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        Ok(Self {
            ptr: view.Value.cast(),
            len: info.RegionSize,
            name: name.to_string(),
            handle,
        })
    }

    pub fn grow(&mut self, len: usize) -> Result<()> {
        if len <= self.len {
            return Ok(());
        }
        Err(Error::map(
            &self.name,
            io::Error::new(io::ErrorKind::Unsupported, "file mappings cannot grow"),
        ))
    }

    pub fn refresh(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Kernel objects live as long as any handle does, so a name held open
    /// here can never be recreated by someone else.
    pub fn is_replaced(&self) -> bool {
        false
    }

    pub fn unlink(_name: &str) -> Result<()> {
        Ok(())
    }

    pub fn exists(name: &str) -> bool {
        Self::open_existing(name).is_ok()
    }
}

#[cfg(windows)]
impl Drop for SharedMemory {
    fn drop(&mut self) {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Memory::{UnmapViewOfFile, MEMORY_MAPPED_VIEW_ADDRESS};

        // SAFETY: ptr is our mapped view and handle our mapping handle.
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.ptr.cast(),
            });
            CloseHandle(self.handle);
        }
    }
}
