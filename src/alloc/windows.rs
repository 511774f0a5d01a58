use core::ptr::NonNull;
use std::io;

use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RESERVE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
};

use super::{
    ffi::{windows as sys, ResourceLimits},
    Protection, SecretAllocator,
};
use crate::util::GuardedLayout;

/// Provides an implementation of the `SecretAllocator` trait for Windows systems.
///
/// Regions are committed with `VirtualAlloc` as `PAGE_NOACCESS`, the usable
/// pages are opened, locked with `VirtualLock` and excluded from Windows
/// Error Reporting dumps. `VirtualLock` is bounded by the minimum working set,
/// so the allocator grows the working set by its heap size while it is alive.
#[derive(Debug, Default)]
pub struct WindowsSecretAllocator(());

impl WindowsSecretAllocator {
    pub fn new() -> Self {
        Self(())
    }
}

impl SecretAllocator for WindowsSecretAllocator {
    fn name(&self) -> &'static str {
        "WindowsProtectedMemoryAllocator"
    }

    fn alloc(&self, layout: &GuardedLayout) -> io::Result<NonNull<u8>> {
        let base = sys::virtual_alloc(layout.total_len(), PAGE_NOACCESS, MEM_COMMIT | MEM_RESERVE)?
            .cast::<u8>();

        let len = layout.usable_len();
        let usable = unsafe { NonNull::new_unchecked(base.as_ptr().add(layout.usable_offset())) };

        if let Err(last_os_error) = sys::virtual_protect(usable, len, PAGE_READWRITE) {
            let _ = sys::virtual_free(base);
            return Err(last_os_error);
        }

        if let Err(last_os_error) = sys::virtual_lock(usable, len) {
            let _ = sys::virtual_free(base);
            return Err(last_os_error);
        }

        if let Err(last_os_error) = sys::wer_exclude(usable, len) {
            let _ = sys::virtual_unlock(usable, len);
            let _ = sys::virtual_free(base);
            return Err(last_os_error);
        }

        Ok(usable)
    }

    fn protect(&self, ptr: NonNull<u8>, len: usize, protection: Protection) -> io::Result<()> {
        let prot = match protection {
            Protection::NoAccess => PAGE_NOACCESS,
            Protection::ReadOnly => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
        };

        sys::virtual_protect(ptr, len, prot).map(|_| ())
    }

    fn dealloc(&self, ptr: NonNull<u8>, layout: &GuardedLayout) -> io::Result<()> {
        let len = layout.usable_len();
        let base = unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(layout.usable_offset())) };

        let unprotected = sys::virtual_protect(ptr, len, PAGE_READWRITE).map(|_| ());
        if unprotected.is_ok() {
            unsafe { super::wipe(ptr, len) };
        }

        // May fail (unchecked), releasing the reservation drops both anyway
        let _ = sys::wer_include(ptr);
        let _ = sys::virtual_unlock(ptr, len);

        let released = sys::virtual_free(base);
        unprotected.and(released)
    }

    fn rlimit_core_resource(&self) -> Option<i32> {
        None
    }

    fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits::default()
    }

    fn disable_core_dumps(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "core dump limits are not available on Windows",
        ))
    }

    fn acquire_quota(&self, bytes: usize) -> io::Result<()> {
        let delta = isize::try_from(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "quota out of bounds"))?;
        sys::adjust_working_set(delta)
    }

    fn release_quota(&self, bytes: usize) {
        if let Ok(delta) = isize::try_from(bytes) {
            if let Err(error) = sys::adjust_working_set(-delta) {
                log::warn!("failed to shrink working set by {bytes} bytes: {error}");
            }
        }
    }
}
