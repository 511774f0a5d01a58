use core::ptr::NonNull;
use std::io;

use super::{
    ffi::{unix as sys, ResourceLimits},
    unix::{self, Locking},
    Protection, SecretAllocator,
};
use crate::util::GuardedLayout;

/// Provides an implementation of the `SecretAllocator` trait for Linux systems.
///
/// This implementation relies on Linux `SYS_memfd_secret` and Unix system calls
/// to manage memory in a way that limits its visibility to other processes and
/// prevents sensitive data from being leaked. Secret memory pages are removed
/// from the kernel direct map and never swapped, so they are not `mlock`ed;
/// guard pages and `MADV_DONTDUMP` are applied as in the anonymous variant.
#[derive(Debug, Default)]
pub struct LinuxSecretAllocator(());

impl LinuxSecretAllocator {
    pub fn new() -> Self {
        Self(())
    }
}

impl SecretAllocator for LinuxSecretAllocator {
    fn name(&self) -> &'static str {
        "LinuxSecretMemoryAllocator"
    }

    fn alloc(&self, layout: &GuardedLayout) -> io::Result<NonNull<u8>> {
        unix::alloc_guarded(layout, Locking::Unevictable, sys::mmap_memfd_secret)
    }

    fn protect(&self, ptr: NonNull<u8>, len: usize, protection: Protection) -> io::Result<()> {
        sys::mprotect(ptr, len, unix::prot_flags(protection))
    }

    fn dealloc(&self, ptr: NonNull<u8>, layout: &GuardedLayout) -> io::Result<()> {
        unix::dealloc_guarded(ptr, layout, Locking::Unevictable, sys::munmap)
    }

    fn rlimit_core_resource(&self) -> Option<i32> {
        Some(sys::rlimit_core_resource())
    }

    fn resource_limits(&self) -> ResourceLimits {
        unix::resource_limits()
    }

    fn disable_core_dumps(&self) -> io::Result<()> {
        sys::disable_core_dumps()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::ffi;

    #[test]
    fn test_secret_memory_round_trip() {
        if !sys::memfd_secret_available() {
            eprintln!("memfd_secret unavailable, skipping");
            return;
        }

        let allocator = LinuxSecretAllocator::new();
        let layout = GuardedLayout::new(4, ffi::page_size()).expect("layout");
        let ptr = allocator.alloc(&layout).expect("Failed to alloc(..)");

        let bytes = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), 4) };
        bytes.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(bytes, &[1, 2, 3, 4]);

        allocator
            .protect(ptr, layout.usable_len(), Protection::ReadOnly)
            .expect("Failed to protect(..)");
        assert_eq!(unsafe { ptr.as_ptr().read() }, 1);

        allocator.dealloc(ptr, &layout).expect("Failed to dealloc(..)");
    }

    #[test]
    fn test_secret_memory_is_wiped_before_release() {
        if !sys::memfd_secret_available() {
            eprintln!("memfd_secret unavailable, skipping");
            return;
        }

        let layout = GuardedLayout::new(64, ffi::page_size()).expect("layout");
        let ptr = unix::alloc_guarded(&layout, Locking::Unevictable, sys::mmap_memfd_secret)
            .expect("Failed to alloc_guarded(..)");
        unsafe { ptr.as_ptr().write_bytes(0xC3, 64) };

        unix::dealloc_guarded(ptr, &layout, Locking::Unevictable, |base, total_len| {
            let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 64) };
            assert!(bytes.iter().all(|&b| b == 0));

            sys::munmap(base, total_len)
        })
        .expect("Failed to dealloc_guarded(..)");
    }
}
