//! Platform variants of the guarded page allocator.
//!
//! Every variant implements [`SecretAllocator`]; the one matching the
//! configured [`Backing`] and the compile target is picked by [`native`].

use core::{fmt, ptr::NonNull};
use std::io;

use crate::{
    config::Backing,
    error::{Error, Result},
    util::GuardedLayout,
};

pub mod ffi;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_family = "unix")]
pub mod unix;
#[cfg(target_family = "windows")]
pub mod windows;

pub use ffi::{ResourceLimits, Rlimit};

/// Access protection of a region of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
}

/// Data model of the compile target, used to tell variants apart by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataModel {
    /// 32-bit `int`, `long` and pointers.
    ILP32,
    /// 64-bit `long` and pointers (Unix-like 64-bit targets).
    LP64,
    /// 32-bit `long`, 64-bit pointers (64-bit Windows).
    LLP64,
}

impl DataModel {
    #[cfg(all(target_family = "windows", target_pointer_width = "64"))]
    pub const NATIVE: Self = Self::LLP64;
    #[cfg(all(not(target_family = "windows"), target_pointer_width = "64"))]
    pub const NATIVE: Self = Self::LP64;
    #[cfg(not(target_pointer_width = "64"))]
    pub const NATIVE: Self = Self::ILP32;

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ILP32 => "ILP32",
            Self::LP64 => "LP64",
            Self::LLP64 => "LLP64",
        }
    }
}

impl fmt::Display for DataModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform-specific page operations behind the protected memory allocator.
///
/// Implementors are the only code allowed to map, lock or change the
/// protection of secret-bearing pages. They do no bookkeeping: validating
/// addresses and lengths is the caller's job.
pub trait SecretAllocator: Send + Sync {
    /// Name of the variant, without the data model suffix.
    fn name(&self) -> &'static str;

    /// Reserves `layout.total_len()` bytes, makes the usable pages read/write,
    /// locks them and excludes them from core dumps.
    ///
    /// On failure every completed step is undone before returning.
    ///
    /// # Returns
    /// The address of the first usable byte.
    fn alloc(&self, layout: &GuardedLayout) -> io::Result<NonNull<u8>>;

    /// Changes the protection of `len` bytes starting at the page-aligned `ptr`.
    // NOTE Protection acts on an entire page, not a section.
    fn protect(&self, ptr: NonNull<u8>, len: usize, protection: Protection) -> io::Result<()>;

    /// Wipes the usable pages, unlocks them and releases the whole mapping.
    fn dealloc(&self, ptr: NonNull<u8>, layout: &GuardedLayout) -> io::Result<()>;

    /// Numeric identifier of the core-dump resource class, if the platform has one.
    fn rlimit_core_resource(&self) -> Option<i32>;

    /// Reads the current resource limits of the process.
    fn resource_limits(&self) -> ResourceLimits;

    /// Forbids core dumps for the whole process.
    fn disable_core_dumps(&self) -> io::Result<()>;

    /// Acquires whatever process-wide resource `bytes` of locked memory need.
    fn acquire_quota(&self, _bytes: usize) -> io::Result<()> {
        Ok(())
    }

    /// Gives back what `acquire_quota` took.
    fn release_quota(&self, _bytes: usize) {}
}

/// Selects the variant for `backing` on the running platform.
pub fn native(backing: Backing) -> Result<Box<dyn SecretAllocator>> {
    match backing {
        #[cfg(target_family = "unix")]
        Backing::Anonymous => Ok(Box::new(unix::UnixSecretAllocator::new())),
        #[cfg(target_family = "windows")]
        Backing::Anonymous => Ok(Box::new(windows::WindowsSecretAllocator::new())),

        #[cfg(target_os = "linux")]
        Backing::SecretMemory if ffi::unix::memfd_secret_available() => {
            Ok(Box::new(linux::LinuxSecretAllocator::new()))
        }
        Backing::SecretMemory => Err(Error::InvalidConfiguration(
            "memfd_secret backing is not available on this system".to_owned(),
        )),
    }
}

/// Wipes `len` bytes at `ptr`.
///
/// # Safety
/// The range must be mapped and writable.
pub(crate) unsafe fn wipe(ptr: NonNull<u8>, len: usize) {
    zeroize::Zeroize::zeroize({
        let bytes_slice = core::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len);
        unsafe { &mut *bytes_slice }
    });
}
