use core::ptr::NonNull;
use std::io;

use libc::{PROT_NONE, PROT_READ, PROT_WRITE};

use super::{
    ffi::{unix as sys, ResourceLimits},
    Protection, SecretAllocator,
};
use crate::util::GuardedLayout;

#[cfg(any(target_os = "linux", target_os = "android"))]
const EXCLUDE_FROM_DUMP: Option<libc::c_int> = Some(libc::MADV_DONTDUMP);
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
const EXCLUDE_FROM_DUMP: Option<libc::c_int> = Some(libc::MADV_NOCORE);
// Apple targets have no per-range dump exclusion; wired pages are at least
// zeroed by the kernel before they are handed out again.
#[cfg(target_vendor = "apple")]
const EXCLUDE_FROM_DUMP: Option<libc::c_int> = Some(libc::MADV_ZERO_WIRED_PAGES);
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_vendor = "apple"
)))]
const EXCLUDE_FROM_DUMP: Option<libc::c_int> = None;

#[cfg(any(target_os = "linux", target_os = "android"))]
const INCLUDE_IN_DUMP: Option<libc::c_int> = Some(libc::MADV_DODUMP);
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
const INCLUDE_IN_DUMP: Option<libc::c_int> = Some(libc::MADV_CORE);
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
const INCLUDE_IN_DUMP: Option<libc::c_int> = None;

#[cfg(target_os = "linux")]
const NAME: &str = "LinuxProtectedMemoryAllocator";
#[cfg(target_os = "macos")]
const NAME: &str = "MacOSProtectedMemoryAllocator";
#[cfg(target_os = "freebsd")]
const NAME: &str = "FreeBSDProtectedMemoryAllocator";
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
const NAME: &str = "UnixProtectedMemoryAllocator";

/// Provides an implementation of the `SecretAllocator` trait for Unix-based systems.
///
/// Regions are anonymous private mappings flanked by `PROT_NONE` guard pages.
/// The usable pages are locked with `mlock` and, where the platform allows it,
/// excluded from core dumps with `madvise`.
#[derive(Debug, Default)]
pub struct UnixSecretAllocator(());

impl UnixSecretAllocator {
    pub fn new() -> Self {
        Self(())
    }
}

impl SecretAllocator for UnixSecretAllocator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn alloc(&self, layout: &GuardedLayout) -> io::Result<NonNull<u8>> {
        self::alloc_guarded(layout, Locking::Mlock, sys::mmap_anonymous)
    }

    fn protect(&self, ptr: NonNull<u8>, len: usize, protection: Protection) -> io::Result<()> {
        sys::mprotect(ptr, len, self::prot_flags(protection))
    }

    fn dealloc(&self, ptr: NonNull<u8>, layout: &GuardedLayout) -> io::Result<()> {
        self::dealloc_guarded(ptr, layout, Locking::Mlock, sys::munmap)
    }

    fn rlimit_core_resource(&self) -> Option<i32> {
        Some(sys::rlimit_core_resource())
    }

    fn resource_limits(&self) -> ResourceLimits {
        self::resource_limits()
    }

    fn disable_core_dumps(&self) -> io::Result<()> {
        sys::disable_core_dumps()
    }
}

#[inline]
pub(super) fn prot_flags(protection: Protection) -> libc::c_int {
    match protection {
        Protection::NoAccess => PROT_NONE,
        Protection::ReadOnly => PROT_READ,
        Protection::ReadWrite => PROT_READ | PROT_WRITE,
    }
}

pub(super) fn resource_limits() -> ResourceLimits {
    ResourceLimits {
        core_dump: sys::getrlimit(sys::Resource::CoreDump).ok(),
        locked_memory: sys::getrlimit(sys::Resource::LockedMemory).ok(),
    }
}

/// How the usable pages of a mapping are kept out of swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Locking {
    /// Pinned with `mlock`/`munlock`.
    Mlock,
    /// Already unevictable, e.g. `memfd_secret` pages. `mlock` fails on them.
    Unevictable,
}

/// Maps a guarded region with `reserve`, then opens, locks and hides its usable pages.
///
/// `reserve` receives the total length and `PROT_NONE`, so the guard pages
/// never become accessible.
pub(super) fn alloc_guarded(
    layout: &GuardedLayout,
    locking: Locking,
    reserve: impl FnOnce(usize, libc::c_int) -> io::Result<NonNull<[u8]>>,
) -> io::Result<NonNull<u8>> {
    let total_len = layout.total_len();
    let base = reserve(total_len, PROT_NONE)?.cast::<u8>();

    let len = layout.usable_len();
    let usable = unsafe { NonNull::new_unchecked(base.as_ptr().add(layout.usable_offset())) };

    if let Err(last_os_error) = sys::mprotect(usable, len, PROT_READ | PROT_WRITE) {
        let _ = sys::munmap(base, total_len);
        return Err(last_os_error);
    }

    if locking == Locking::Mlock {
        if let Err(last_os_error) = sys::mlock(usable, len) {
            let _ = sys::munmap(base, total_len);
            return Err(last_os_error);
        }
    }

    if let Some(advice) = EXCLUDE_FROM_DUMP {
        if let Err(last_os_error) = sys::madvise(usable, len, advice) {
            if locking == Locking::Mlock {
                let _ = sys::munlock(usable, len);
            }
            let _ = sys::munmap(base, total_len);
            return Err(last_os_error);
        }
    }

    Ok(usable)
}

/// Wipes the usable pages, then hands the whole mapping to `release`.
///
/// `release` receives the base address and total length. It is called even
/// if the pages cannot be made writable again; the first error is returned.
pub(super) fn dealloc_guarded(
    ptr: NonNull<u8>,
    layout: &GuardedLayout,
    locking: Locking,
    release: impl FnOnce(NonNull<u8>, usize) -> io::Result<()>,
) -> io::Result<()> {
    let len = layout.usable_len();
    let base = unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(layout.usable_offset())) };

    let unprotected = sys::mprotect(ptr, len, PROT_READ | PROT_WRITE);
    match &unprotected {
        Ok(()) => unsafe { super::wipe(ptr, len) },
        Err(error) => log::warn!("releasing {len} bytes at {ptr:p} without wiping: {error}"),
    }

    // May fail (unchecked), the mapping is about to go away
    if let Some(advice) = INCLUDE_IN_DUMP {
        let _ = sys::madvise(ptr, len, advice);
    }

    // May fail (unchecked), the pages are unlocked by munmap anyway
    if locking == Locking::Mlock {
        let _ = sys::munlock(ptr, len);
    }

    let released = release(base, layout.total_len());
    unprotected.and(released)
}
