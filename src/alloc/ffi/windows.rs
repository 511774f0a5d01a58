use core::{
    mem::MaybeUninit,
    ptr::{self, NonNull},
};
use std::io;

use windows_sys::Win32::System::{
    ErrorReporting as wer, Memory as win, SystemInformation as win_info, Threading as win_proc,
};

/// Reserves and commits a memory region in the process's address space.
///
/// Wraps the `VirtualAlloc` system call.
///
/// # Arguments
///
/// * `len` - The length of the memory region.
/// * `prot` - Memory protection flags.
/// * `flags` - Allocation flags.
///
/// # Returns
///
/// * A result containing a non-null pointer to the memory region on success,
///   or an I/O error on failure.
pub fn virtual_alloc(len: usize, prot: u32, flags: u32) -> io::Result<NonNull<[u8]>> {
    match unsafe { win::VirtualAlloc(ptr::null(), len, flags, prot) } {
        ptr if ptr.is_null() => Err(io::Error::last_os_error()),
        ptr => {
            let ptr = unsafe { NonNull::new_unchecked(ptr as *mut u8) };
            Ok(NonNull::slice_from_raw_parts(ptr, len))
        }
    }
}

/// Changes the protection on a region of committed pages in the virtual
/// address space.
///
/// Wraps the `VirtualProtect` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
/// * `prot` - The new protection flags.
///
/// # Returns
///
/// * A result containing the old protection flags on success,
///   or an I/O error on failure.
pub fn virtual_protect(ptr: NonNull<u8>, len: usize, prot: u32) -> io::Result<u32> {
    let mut old_protect = 0u32;
    match unsafe { win::VirtualProtect(ptr.as_ptr() as _, len, prot, &mut old_protect) } {
        0 => Err(io::Error::last_os_error()),
        _ => Ok(old_protect),
    }
}

/// Locks a memory region, preventing it from being paged out.
///
/// Wraps the `VirtualLock` system call. The number of lockable pages is
/// bounded by the process's minimum working set size.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn virtual_lock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { win::VirtualLock(ptr.as_ptr() as _, len) } {
        0 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Unlocks a memory region, allowing it to be paged out.
///
/// Wraps the `VirtualUnlock` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn virtual_unlock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { win::VirtualUnlock(ptr.as_ptr() as _, len) } {
        0 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Releases a region of pages reserved by `virtual_alloc`.
///
/// Wraps the `VirtualFree` system call with `MEM_RELEASE`, which always
/// releases the whole reservation.
///
/// # Arguments
///
/// * `ptr` - The base address returned by `virtual_alloc`.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn virtual_free(ptr: NonNull<u8>) -> io::Result<()> {
    match unsafe { win::VirtualFree(ptr.as_ptr() as _, 0, win::MEM_RELEASE) } {
        0 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Excludes a memory region from Windows Error Reporting crash dumps.
///
/// Wraps the `WerRegisterExcludedMemoryBlock` system call. The block size is
/// a 32-bit `DWORD` even on LLP64 targets.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn wer_exclude(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length out of bounds"))?;

    match unsafe { wer::WerRegisterExcludedMemoryBlock(ptr.as_ptr() as _, len) } {
        hr if hr < 0 => Err(io::Error::from_raw_os_error(hr)),
        _ => Ok(()),
    }
}

/// Removes a memory region previously passed to `wer_exclude`.
///
/// Wraps the `WerUnregisterExcludedMemoryBlock` system call.
pub fn wer_include(ptr: NonNull<u8>) -> io::Result<()> {
    match unsafe { wer::WerUnregisterExcludedMemoryBlock(ptr.as_ptr() as _) } {
        hr if hr < 0 => Err(io::Error::from_raw_os_error(hr)),
        _ => Ok(()),
    }
}

/// Grows (or shrinks, for a negative `delta`) the process working set.
///
/// Wraps the `GetProcessWorkingSetSize` and `SetProcessWorkingSetSize`
/// system calls. Both the minimum and maximum are moved by `delta` bytes.
pub fn adjust_working_set(delta: isize) -> io::Result<()> {
    let process = unsafe { win_proc::GetCurrentProcess() };
    let (mut min, mut max) = (0usize, 0usize);

    if unsafe { win_proc::GetProcessWorkingSetSize(process, &mut min, &mut max) } == 0 {
        return Err(io::Error::last_os_error());
    }

    let (min, max) = if delta >= 0 {
        (min.saturating_add(delta as usize), max.saturating_add(delta as usize))
    } else {
        (min.saturating_sub(delta.unsigned_abs()), max.saturating_sub(delta.unsigned_abs()))
    };

    match unsafe { win_proc::SetProcessWorkingSetSize(process, min, max) } {
        0 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Retrieves the system's page size.
///
/// Wraps the `GetSystemInfo` system call.
///
/// # Returns
///
/// * The size of a memory page in bytes.
#[inline]
pub(super) fn page_size() -> usize {
    let sys_info = {
        let mut sys_info = MaybeUninit::<win_info::SYSTEM_INFO>::uninit();
        unsafe {
            win_info::GetSystemInfo(sys_info.as_mut_ptr());
            sys_info.assume_init()
        }
    };

    sys_info.dwPageSize as usize
}
