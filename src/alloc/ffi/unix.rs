use core::ptr::{self, NonNull};
use std::io;

use super::Rlimit;

/// Resource classes read through `getrlimit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// `RLIMIT_CORE`, the maximum size of a core dump.
    CoreDump,
    /// `RLIMIT_MEMLOCK`, the maximum number of bytes that may be locked.
    LockedMemory,
}

/// Maps an anonymous private region into the process's address space.
///
/// Wraps the `mmap` system call with `MAP_PRIVATE | MAP_ANON`.
///
/// # Arguments
///
/// * `len` - The length of the memory region.
/// * `prot` - Memory protection flags.
///
/// # Returns
///
/// * A result containing a non-null pointer to the memory region on success,
///   or an I/O error on failure.
pub fn mmap_anonymous(len: usize, prot: i32) -> io::Result<NonNull<[u8]>> {
    self::mmap_impl(len, prot, libc::MAP_PRIVATE | libc::MAP_ANON, -1)
}

/// Creates a memory-mapped region with secret properties on Linux.
///
/// Wraps the `SYS_memfd_secret`, `ftruncate` and `mmap` system calls. Pages of
/// the mapping are removed from the kernel direct map and cannot be read by
/// other processes, even privileged ones.
///
/// # Arguments
///
/// * `len` - The length of the memory region.
/// * `prot` - Memory protection flags.
///
/// # Returns
///
/// * A result containing a non-null pointer to the memory region on success,
///   or an I/O error on failure.
#[cfg(target_os = "linux")]
pub fn mmap_memfd_secret(len: usize, prot: i32) -> io::Result<NonNull<[u8]>> {
    let size = libc::off_t::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length out of bounds"))?;

    let fd = match unsafe { libc::syscall(libc::SYS_memfd_secret, libc::O_CLOEXEC) } {
        -1 => return Err(io::Error::last_os_error()),
        fd => fd as libc::c_int,
    };

    let result = match unsafe { libc::ftruncate(fd, size) } {
        -1 => Err(io::Error::last_os_error()),
        _ => self::mmap_impl(len, prot, libc::MAP_SHARED, fd),
    };

    unsafe { libc::close(fd) };
    result
}

/// Checks if the `memfd_secret` system call is supported on the current system.
///
/// The call is rejected with `ENOSYS` on kernels built without it and
/// with `EINVAL`/`ENOMEM` when secret memory is disabled at boot.
///
/// # Returns
///
/// * Boolean indicating whether `memfd_secret` is supported or not.
#[cfg(target_os = "linux")]
pub fn memfd_secret_available() -> bool {
    match unsafe { libc::syscall(libc::SYS_memfd_secret, libc::O_CLOEXEC) } {
        -1 => false,
        fd => {
            unsafe { libc::close(fd as libc::c_int) };
            true
        }
    }
}

/// Changes the access protection of a memory region.
///
/// Wraps the `mprotect` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null, page-aligned pointer to the memory region.
/// * `len` - The length of the memory region.
/// * `prot` - The new protection flags.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn mprotect(ptr: NonNull<u8>, len: usize, prot: i32) -> io::Result<()> {
    match unsafe { libc::mprotect(ptr.as_ptr() as _, len, prot) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Provides advice about the use of memory.
///
/// Wraps the `madvise` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
/// * `advice` - The advice to be given.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn madvise(ptr: NonNull<u8>, len: usize, advice: i32) -> io::Result<()> {
    match unsafe { libc::madvise(ptr.as_ptr() as _, len, advice) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Locks a memory region, preventing it from being paged out to swap.
///
/// Wraps the `mlock` system call. Fails with `ENOMEM`/`EAGAIN` once the
/// process's `RLIMIT_MEMLOCK` is exhausted.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn mlock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::mlock(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Unlocks a memory region, allowing it to be paged out to swap.
///
/// Wraps the `munlock` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn munlock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::munlock(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Unmaps a memory region within the process's address space.
///
/// Wraps the `munmap` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn munmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::munmap(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Reads the soft and hard values of a resource limit.
///
/// Wraps the `getrlimit` system call.
pub fn getrlimit(resource: Resource) -> io::Result<Rlimit> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    match unsafe { libc::getrlimit(self::resource_id(resource), &mut rlim) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(Rlimit {
            soft: self::limit_value(rlim.rlim_cur),
            hard: self::limit_value(rlim.rlim_max),
        }),
    }
}

/// Sets the soft and hard core-dump size limit of the process to zero.
///
/// Wraps the `setrlimit` system call. Lowering a limit never requires
/// privileges, but it cannot be raised again by an unprivileged process.
pub fn disable_core_dumps() -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    match unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rlim) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Returns the numeric identifier of the core-dump resource class.
#[inline]
pub fn rlimit_core_resource() -> i32 {
    libc::RLIMIT_CORE as i32
}

#[inline]
fn resource_id(resource: Resource) -> RlimitResource {
    match resource {
        Resource::CoreDump => libc::RLIMIT_CORE,
        Resource::LockedMemory => libc::RLIMIT_MEMLOCK,
    }
}

// glibc declares the resource argument as an unsigned enum.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

#[inline]
fn limit_value(value: libc::rlim_t) -> Option<u64> {
    match value {
        libc::RLIM_INFINITY => None,
        value => Some(value as u64),
    }
}

/// Used by `mmap_anonymous` and `mmap_memfd_secret` functions
#[inline]
fn mmap_impl(len: usize, prot: i32, flags: i32, fd: i32) -> io::Result<NonNull<[u8]>> {
    match unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, fd, 0) } {
        libc::MAP_FAILED => Err(io::Error::last_os_error()),
        ptr => {
            let ptr = unsafe { NonNull::new_unchecked(ptr as *mut u8) };
            Ok(NonNull::slice_from_raw_parts(ptr, len))
        }
    }
}

/// Retrieves the system's page size.
///
/// Wraps the `sysconf` system call on Unix-like systems
/// and `vm_page_size` on macOS.
///
/// # Returns
///
/// * The size of a memory page in bytes.
#[inline]
pub(super) fn page_size() -> usize {
    #[cfg(target_os = "macos")]
    unsafe {
        libc::vm_page_size as usize
    }
    #[cfg(not(target_os = "macos"))]
    unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }
}
