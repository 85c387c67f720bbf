// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory region management.
//!
//! Safe wrappers around `shm_open`, `ftruncate`, and `mmap` for creating
//! and attaching named shared regions.
//!
//! # Region Lifecycle
//!
//! 1. The broker creates the region with [`SharedRegion::create`]
//! 2. Peers attach with [`SharedRegion::attach`]
//! 3. The mapping is unmapped on drop
//! 4. The broker removes the name with [`SharedRegion::unlink`]
//!
//! Creation is strictly exclusive (`O_EXCL`): a taken name reports
//! [`ShmError::AlreadyExists`] so callers can race on it (that race is
//! what [`SysLock`](super::SysLock) is made of). Nothing but an explicit
//! unlink ever removes a region, so a broker's region survives any number
//! of peers coming and going.
//!
//! # Naming Convention
//!
//! Region names must start with `/` and contain no other `/`.

use super::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped POSIX shared memory region.
///
/// Automatically unmaps the memory on drop. Does NOT automatically
/// unlink the name (the creator's responsibility).
pub struct SharedRegion {
    /// Pointer to the mapped memory
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Region name (for unlink)
    name: String,
}

// SAFETY: the mapping is cross-process shared memory; all concurrent
// access goes through atomic operations on the mapped bytes.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a new region, exclusively.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the name is taken, otherwise the underlying
    /// OS error.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY:
        // - c_name is a valid null-terminated CString created above
        // - O_CREAT|O_RDWR|O_EXCL creates a new object or fails with EEXIST
        // - mode 0o600 is a valid permission mask
        // - shm_open returns a valid fd on success or -1 on error (checked)
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::AlreadyExists {
                return Err(ShmError::AlreadyExists(name.to_string()));
            }
            return Err(ShmError::Create(err));
        }

        // SAFETY:
        // - fd is a valid descriptor from the successful shm_open above
        // - ftruncate fails gracefully if size is out of range
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid and not used after this error path.
            unsafe { libc::close(fd) };
            // Creation failed half-way; leave no name behind.
            Self::unlink(name).ok();
            return Err(ShmError::Create(err));
        }

        let ptr = Self::map(fd, size)?;

        // Zero-initialize: the transport protocol starts from all-FREE,
        // all-IDLE slots.
        // SAFETY:
        // - ptr is valid for exactly `size` bytes from the successful mmap
        // - the mapping is PROT_WRITE and nothing else references it yet
        unsafe {
            ptr::write_bytes(ptr, 0, size);
        }

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Attach to an existing region.
    ///
    /// # Errors
    ///
    /// `NotFound` if no region exists under the name.
    pub fn attach(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY:
        // - c_name is a valid null-terminated CString created above
        // - O_RDWR opens an existing object for read/write; mode is ignored
        // - shm_open returns a valid fd on success or -1 on error (checked)
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::Create(err));
        }

        let ptr = Self::map(fd, size)?;

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// mmap a descriptor and close it (the mapping keeps its own
    /// reference to the object).
    fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        // SAFETY:
        // - null first argument lets the kernel pick the address
        // - PROT_READ|PROT_WRITE with MAP_SHARED is a valid shared mapping
        // - fd is valid from the caller's successful shm_open
        // - mmap returns MAP_FAILED on error (checked below)
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // SAFETY: fd is valid; the mapping (if any) holds its own
        // reference, so closing is safe on both paths.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Map(io::Error::last_os_error()));
        }

        Ok(ptr.cast::<u8>())
    }

    /// Validate region name follows POSIX rules
    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(ShmError::InvalidName(format!(
                "region name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(ShmError::InvalidName(format!(
                "region name cannot contain '/' after prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(ShmError::InvalidName(format!(
                "region name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Unlink (delete) a region by name.
    ///
    /// Mappings survive until each holder unmaps; only the name goes
    /// away. Absence is not an error (idempotent cleanup).
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY:
        // - c_name is a valid null-terminated CString created above
        // - shm_unlink only touches the filesystem namespace
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::Unlink(err));
            }
        }

        Ok(())
    }

    /// Raw pointer to the mapped bytes.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Region name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - self.ptr came from a successful mmap of exactly self.size bytes
        // - Drop runs at most once, so the region is unmapped at most once
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
        // The name is NOT unlinked here; the creator does that explicitly.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/mpkv_test_{tag}_{ts}_{}", fastrand::u32(..))
    }

    #[test]
    fn test_validate_name() {
        assert!(SharedRegion::validate_name("/foo").is_ok());
        assert!(SharedRegion::validate_name("foo").is_err());
        assert!(SharedRegion::validate_name("/foo/bar").is_err());
    }

    #[test]
    fn test_create_attach_shares_bytes() {
        let name = unique_name("share");
        let created = SharedRegion::create(&name, 4096).expect("create");
        assert_eq!(created.size(), 4096);

        // SAFETY: the region was just created with 4096 bytes; offsets
        // 0 and 1 are in bounds.
        unsafe {
            *created.as_ptr() = 0x42;
            *created.as_ptr().add(1) = 0x43;
        }

        let attached = SharedRegion::attach(&name, 4096).expect("attach");
        // SAFETY: same object, same size; bytes written above.
        unsafe {
            assert_eq!(*attached.as_ptr(), 0x42);
            assert_eq!(*attached.as_ptr().add(1), 0x43);
        }

        drop(created);
        drop(attached);
        SharedRegion::unlink(&name).ok();
    }

    #[test]
    fn test_create_is_exclusive() {
        let name = unique_name("excl");
        let _first = SharedRegion::create(&name, 64).expect("create");
        let second = SharedRegion::create(&name, 64);
        assert!(matches!(second, Err(ShmError::AlreadyExists(_))));
        SharedRegion::unlink(&name).ok();
    }

    #[test]
    fn test_attach_missing_is_not_found() {
        let result = SharedRegion::attach("/mpkv_test_missing_region", 64);
        assert!(matches!(result, Err(ShmError::NotFound(_))));
    }

    #[test]
    fn test_create_zeroes_the_region() {
        let name = unique_name("zero");
        let region = SharedRegion::create(&name, 256).expect("create");
        // SAFETY: region is 256 bytes, freshly mapped.
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));
        drop(region);
        SharedRegion::unlink(&name).ok();
    }

    #[test]
    fn test_unlink_idempotent() {
        let name = unique_name("unlink");
        let _region = SharedRegion::create(&name, 64).expect("create");
        assert!(SharedRegion::unlink(&name).is_ok());
        assert!(SharedRegion::unlink(&name).is_ok());
    }

    #[test]
    fn test_region_outlives_attacher_until_unlink() {
        let name = unique_name("persist");
        let created = SharedRegion::create(&name, 64).expect("create");
        {
            let attached = SharedRegion::attach(&name, 64).expect("attach");
            drop(attached);
        }
        // A peer detaching does not take the name with it.
        assert!(SharedRegion::attach(&name, 64).is_ok());
        drop(created);
        SharedRegion::unlink(&name).ok();
    }
}
