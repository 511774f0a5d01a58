use core::ptr::NonNull;

use proptest::prelude::*;
use protected_mem::{Backing, Config, Error, Operation, ProtectedMemoryAllocator};
use serial_test::serial;

fn allocator() -> ProtectedMemoryAllocator {
    ProtectedMemoryAllocator::new(32000, 128).expect("Failed to new(..)")
}

fn disposed_allocator() -> (ProtectedMemoryAllocator, String) {
    let allocator = allocator();
    let name = allocator.name().to_owned();
    allocator.dispose();
    (allocator, name)
}

fn bogus_ptr() -> NonNull<u8> {
    NonNull::new(usize::MAX as *mut u8).expect("non-null")
}

fn assert_disposed(result: Result<(), Error>, operation: Operation, name: &str) {
    match result {
        Err(error @ Error::Disposed { .. }) => {
            assert_eq!(error.to_string(), format!("Called {operation} on disposed {name}"));
        }
        other => panic!("expected Disposed error, got {other:?}"),
    }
}

// =============================================================================
// alloc() / free()
// =============================================================================

#[test]
fn test_alloc_free() {
    let allocator = allocator();
    let orig_value = [1u8, 2, 3, 4];

    let ptr = allocator.alloc(orig_value.len()).expect("Failed to alloc(..)");
    unsafe { core::ptr::copy_nonoverlapping(orig_value.as_ptr(), ptr.as_ptr(), orig_value.len()) };

    let mut ret_value = [0u8; 4];
    unsafe { core::ptr::copy_nonoverlapping(ptr.as_ptr(), ret_value.as_mut_ptr(), ret_value.len()) };
    assert_eq!(orig_value, ret_value);

    allocator.free(ptr, orig_value.len()).expect("Failed to free(..)");
}

#[test]
fn test_alloc_at_heap_size_succeeds_and_beyond_fails() {
    let allocator = allocator();

    let ptr = allocator.alloc(32000).expect("boundary allocation failed");
    allocator.free(ptr, 32000).expect("Failed to free(..)");

    let result = allocator.alloc(32001);
    assert!(matches!(result, Err(Error::AllocationFailed { .. })));
}

#[test]
fn test_alloc_of_unmappable_length_fails() {
    let result = allocator().alloc(isize::MAX as usize);
    assert!(matches!(result, Err(Error::AllocationFailed { .. })));
}

#[test]
fn test_alloc_zero_is_rejected() {
    let result = allocator().alloc(0);
    assert!(matches!(result, Err(Error::PreconditionViolation { .. })));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_written_bytes_read_back(data in proptest::collection::vec(any::<u8>(), 1..=32000)) {
        let allocator = allocator();
        let ptr = allocator.alloc(data.len()).expect("Failed to alloc(..)");

        let region = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), data.len()) };
        region.copy_from_slice(&data);
        allocator.set_read_access(ptr, data.len()).expect("Failed to set_read_access(..)");
        prop_assert_eq!(&*region, &data[..]);

        allocator.free(ptr, data.len()).expect("Failed to free(..)");
    }
}

// =============================================================================
// get_rlimit_core_resource() / resource_limits()
// =============================================================================

#[cfg(target_os = "linux")]
#[test]
fn test_get_resource_core() {
    let allocator = allocator();

    assert_eq!(allocator.get_rlimit_core_resource().ok(), Some(4));
    assert_eq!(allocator.get_rlimit_core_resource().ok(), Some(4));
}

#[cfg(target_family = "unix")]
#[test]
#[serial(rlimit)]
fn test_resource_limits_are_readable() {
    let limits = allocator().resource_limits().expect("Failed to resource_limits()");

    assert!(limits.core_dump.is_some());
    assert!(limits.locked_memory.is_some());
}

/// Runs `f` in a forked child, so process-wide changes it makes do not leak
/// into the rest of the test binary. Returns whether `f` returned `true`.
#[cfg(target_family = "unix")]
fn passes_in_child(f: impl FnOnce() -> bool) -> bool {
    match unsafe { libc::fork() } {
        -1 => panic!("Failed to fork()"),
        0 => {
            let passed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).unwrap_or(false);
            unsafe { libc::_exit(if passed { 0 } else { 1 }) }
        }
        child_pid => {
            let mut status: libc::c_int = 0;
            unsafe { libc::waitpid(child_pid, &mut status, 0) };

            libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
        }
    }
}

#[cfg(target_family = "unix")]
#[test]
#[serial(rlimit)]
fn test_disable_core_dumps_zeroes_core_limit() {
    let passed = passes_in_child(|| {
        let config = Config::new(32000, 128).with_core_dumps_disabled(true);
        ProtectedMemoryAllocator::with_config(config)
            .and_then(|allocator| allocator.resource_limits())
            .is_ok_and(|limits| limits.core_dumps_disabled())
    });
    assert!(passed);
}

// =============================================================================
// dispose()
// =============================================================================

#[test]
fn test_set_no_access_after_dispose() {
    let (allocator, name) = disposed_allocator();
    let result = allocator.set_no_access(bogus_ptr(), 0);
    assert_disposed(result, Operation::SetNoAccess, &name);
}

#[test]
fn test_read_access_after_dispose() {
    let (allocator, name) = disposed_allocator();
    let result = allocator.set_read_access(bogus_ptr(), 0);
    assert_disposed(result, Operation::SetReadAccess, &name);
}

#[test]
fn test_read_write_access_after_dispose() {
    let (allocator, name) = disposed_allocator();
    let result = allocator.set_read_write_access(bogus_ptr(), 0);
    assert_disposed(result, Operation::SetReadWriteAccess, &name);
}

#[test]
fn test_alloc_after_dispose() {
    let (allocator, name) = disposed_allocator();
    let result = allocator.alloc(0).map(|_| ());
    assert_disposed(result, Operation::Alloc, &name);
}

#[test]
fn test_free_after_dispose() {
    let (allocator, name) = disposed_allocator();
    let result = allocator.free(bogus_ptr(), 0);
    assert_disposed(result, Operation::Free, &name);
}

#[test]
fn test_get_rlimit_core_resource_after_dispose() {
    let (allocator, name) = disposed_allocator();
    let result = allocator.get_rlimit_core_resource().map(|_| ());
    assert_disposed(result, Operation::GetRlimitCoreResource, &name);
}

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
#[test]
fn test_disposed_message_on_linux() {
    let (allocator, _) = disposed_allocator();

    let error = allocator.set_no_access(bogus_ptr(), 0).expect_err("disposed call succeeded");
    assert_eq!(
        error.to_string(),
        "Called SetNoAccess on disposed LinuxProtectedMemoryAllocatorLP64"
    );
}

#[test]
fn test_dispose_is_idempotent() {
    let allocator = allocator();

    allocator.dispose();
    allocator.dispose();
    assert!(allocator.is_disposed());
}

// =============================================================================
// backing
// =============================================================================

#[cfg(target_os = "linux")]
#[test]
fn test_secret_memory_backing_when_available() {
    let config = Config::new(32000, 128).with_backing(Backing::SecretMemory);

    let allocator = match ProtectedMemoryAllocator::with_config(config) {
        Ok(allocator) => allocator,
        Err(Error::InvalidConfiguration(reason)) => {
            eprintln!("{reason}, skipping");
            return;
        }
        Err(error) => panic!("unexpected error: {error}"),
    };

    assert!(allocator.name().starts_with("LinuxSecretMemoryAllocator"));
    let ptr = allocator.alloc(4).expect("Failed to alloc(..)");
    unsafe { ptr.as_ptr().write_bytes(9, 4) };
    allocator.free(ptr, 4).expect("Failed to free(..)");
}

// =============================================================================
// faults
// =============================================================================

#[cfg(target_os = "linux")]
mod faults {
    use super::*;

    /// Reads `addr` in a forked child and reports whether it died of SIGSEGV.
    fn read_faults(addr: *const u8) -> bool {
        match unsafe { libc::fork() } {
            -1 => panic!("Failed to fork()"),
            0 => unsafe {
                let _ = core::ptr::read_volatile(addr);
                libc::_exit(0)
            },
            child_pid => {
                let mut status: libc::c_int = 0;
                unsafe { libc::waitpid(child_pid, &mut status, 0) };

                libc::WIFSIGNALED(status) && libc::WTERMSIG(status) == libc::SIGSEGV
            }
        }
    }

    #[test]
    fn test_guard_pages_fault() {
        let allocator = allocator();
        let ptr = allocator.alloc(4).expect("Failed to alloc(..)");
        let page_size = allocator.page_size();

        assert!(!read_faults(ptr.as_ptr()));
        assert!(read_faults(unsafe { ptr.as_ptr().add(page_size) }));
        assert!(read_faults(unsafe { ptr.as_ptr().sub(1) }));

        allocator.free(ptr, 4).expect("Failed to free(..)");
    }

    #[test]
    fn test_no_access_region_faults() {
        let allocator = allocator();
        let ptr = allocator.alloc(4).expect("Failed to alloc(..)");

        allocator.set_no_access(ptr, 4).expect("Failed to set_no_access(..)");
        assert!(read_faults(ptr.as_ptr()));

        allocator.set_read_access(ptr, 4).expect("Failed to set_read_access(..)");
        assert!(!read_faults(ptr.as_ptr()));

        allocator.free(ptr, 4).expect("Failed to free(..)");
    }
}
