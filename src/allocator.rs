use core::{fmt, ptr::NonNull};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use crate::{
    alloc::{self, ffi, DataModel, Protection, ResourceLimits, SecretAllocator},
    config::Config,
    error::{Error, Operation, Result},
    ledger::{Ledger, Region},
    util::{self, GuardedLayout},
};

/// Allocator of guarded, page-locked regions for secrets.
///
/// Every region handed out by [`alloc`](Self::alloc) sits between two
/// inaccessible guard pages, is locked into RAM and excluded from core dumps.
/// Its protection is changed explicitly with the `set_*_access` methods and it
/// is wiped before being unmapped by [`free`](Self::free).
///
/// The sum of outstanding requests (each rounded up to the minimum allocation
/// size) may not exceed the heap size. Once [`dispose`](Self::dispose) has been
/// called every operation fails with [`Error::Disposed`].
///
/// The allocator is `Send + Sync`; operations on distinct regions do not
/// serialize on each other.
pub struct ProtectedMemoryAllocator {
    name: String,
    heap_size: usize,
    minimum_allocation_size: usize,
    page_size: usize,
    limits: ResourceLimits,
    pages: Box<dyn SecretAllocator>,
    quota: usize,
    disposed: AtomicBool,
    ledger: Mutex<Ledger>,
}

impl ProtectedMemoryAllocator {
    /// Creates an allocator with a `heap_size` byte ceiling, charging every
    /// request in multiples of `minimum_allocation_size`.
    pub fn new(heap_size: usize, minimum_allocation_size: usize) -> Result<Self> {
        Self::with_config(Config::new(heap_size, minimum_allocation_size))
    }

    pub fn with_config(config: Config) -> Result<Self> {
        let page_size = ffi::page_size();
        config.validate(page_size)?;

        let pages = alloc::native(config.backing)?;
        let name = format!("{}{}", pages.name(), DataModel::NATIVE);

        if config.disable_core_dumps {
            pages.disable_core_dumps().map_err(|error| {
                Error::InvalidConfiguration(format!("cannot disable core dumps: {error}"))
            })?;
        }

        let limits = pages.resource_limits();
        if let Some(soft) = limits.locked_memory.and_then(|limit| limit.soft) {
            if soft < config.heap_size as u64 {
                log::warn!(
                    "{name}: heap size {} exceeds the locked memory limit of {soft} bytes",
                    config.heap_size
                );
            }
        }

        // Checked by `Config::validate`
        let quota = GuardedLayout::new(config.heap_size, page_size)
            .map_or(config.heap_size, |layout| layout.total_len());
        pages.acquire_quota(quota).map_err(|error| {
            Error::InvalidConfiguration(format!("cannot reserve {quota} lockable bytes: {error}"))
        })?;

        log::debug!(
            "{name}: heap_size={} minimum_allocation_size={} page_size={page_size} core_dumps_disabled={}",
            config.heap_size,
            config.minimum_allocation_size,
            limits.core_dumps_disabled()
        );

        Ok(Self {
            name,
            heap_size: config.heap_size,
            minimum_allocation_size: config.minimum_allocation_size,
            page_size,
            limits,
            pages,
            quota,
            disposed: AtomicBool::new(false),
            ledger: Mutex::new(Ledger::default()),
        })
    }

    /// Allocates a region able to hold `len` bytes.
    ///
    /// The region starts zeroed and read/write. `len` must be greater than zero.
    pub fn alloc(&self, len: usize) -> Result<NonNull<u8>> {
        self.ensure_active(Operation::Alloc)?;

        if len == 0 {
            return Err(Self::violation(Operation::Alloc, "length is zero"));
        }

        // An unrepresentable charge is beyond any heap size
        let charge = util::round_up(len, self.minimum_allocation_size).unwrap_or(usize::MAX);
        self.ledger()
            .reserve(charge, self.heap_size)
            .map_err(|source| Error::AllocationFailed {
                requested: len,
                source,
            })?;

        // Every length within the heap size maps, see `Config::validate`
        let mapped = GuardedLayout::new(len, self.page_size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "length cannot be mapped"))
            .and_then(|layout| self.pages.alloc(&layout).map(|ptr| (ptr, layout)));

        let (ptr, layout) = match mapped {
            Ok(mapped) => mapped,
            Err(source) => {
                self.ledger().refund(charge);
                return Err(Error::AllocationFailed {
                    requested: len,
                    source,
                });
            }
        };

        self.ledger().insert(
            ptr.as_ptr() as usize,
            Region {
                len,
                layout,
                charge,
                protection: Some(Protection::ReadWrite),
            },
        );

        log::trace!("{}: allocated {len} bytes at {ptr:p}", self.name);
        Ok(ptr)
    }

    /// Wipes and releases a region returned by [`alloc`](Self::alloc).
    ///
    /// `len` must be the length passed to `alloc`. The region must not be
    /// accessed afterwards.
    pub fn free(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        self.ensure_active(Operation::Free)?;

        let region = self
            .ledger()
            .remove(ptr.as_ptr() as usize, len)
            .map_err(|reason| Self::violation(Operation::Free, reason))?;

        self.pages
            .dealloc(ptr, &region.layout)
            .map_err(|source| Error::Os {
                operation: Operation::Free,
                source,
            })?;

        log::trace!("{}: freed {len} bytes at {ptr:p}", self.name);
        Ok(())
    }

    /// Makes the pages covering `[ptr, ptr + len)` inaccessible.
    pub fn set_no_access(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        self.set_access(Operation::SetNoAccess, ptr, len, Protection::NoAccess)
    }

    /// Makes the pages covering `[ptr, ptr + len)` read-only.
    pub fn set_read_access(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        self.set_access(Operation::SetReadAccess, ptr, len, Protection::ReadOnly)
    }

    /// Makes the pages covering `[ptr, ptr + len)` readable and writable.
    pub fn set_read_write_access(&self, ptr: NonNull<u8>, len: usize) -> Result<()> {
        self.set_access(Operation::SetReadWriteAccess, ptr, len, Protection::ReadWrite)
    }

    /// Protection last applied to the whole region starting at `ptr`.
    ///
    /// Returns `None` if only part of the region was transitioned since.
    pub fn protection(&self, ptr: NonNull<u8>) -> Result<Option<Protection>> {
        self.ensure_active(Operation::Protection)?;

        self.ledger()
            .get(ptr.as_ptr() as usize)
            .map(|region| region.protection)
            .ok_or_else(|| {
                Self::violation(
                    Operation::Protection,
                    "address was not returned by this allocator",
                )
            })
    }

    /// Identifier of the core-dump resource class (`RLIMIT_CORE`).
    pub fn get_rlimit_core_resource(&self) -> Result<i32> {
        self.ensure_active(Operation::GetRlimitCoreResource)?;

        self.pages
            .rlimit_core_resource()
            .ok_or(Error::Unsupported {
                operation: Operation::GetRlimitCoreResource,
            })
    }

    /// Resource limits of the process, as read on construction.
    pub fn resource_limits(&self) -> Result<ResourceLimits> {
        self.ensure_active(Operation::ResourceLimits)?;
        Ok(self.limits)
    }

    /// Releases the allocator. Calling it again has no effect.
    ///
    /// Outstanding regions are not freed; they stay owned by their callers.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let outstanding = self.ledger().len();
        if outstanding > 0 {
            log::warn!(
                "{}: disposed with {outstanding} allocation(s) still outstanding",
                self.name
            );
        }

        self.pages.release_quota(self.quota);
        log::debug!("{}: disposed", self.name);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Name of the platform variant, e.g. `LinuxProtectedMemoryAllocatorLP64`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn minimum_allocation_size(&self) -> usize {
        self.minimum_allocation_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Heap bytes charged to live allocations.
    pub fn outstanding_bytes(&self) -> usize {
        self.ledger().outstanding()
    }

    pub fn outstanding_allocations(&self) -> usize {
        self.ledger().len()
    }

    fn set_access(
        &self,
        operation: Operation,
        ptr: NonNull<u8>,
        len: usize,
        protection: Protection,
    ) -> Result<()> {
        self.ensure_active(operation)?;

        let span = self
            .ledger()
            .span(ptr.as_ptr() as usize, len)
            .map_err(|reason| Self::violation(operation, reason))?;

        // `span` lies within the usable pages of a live region
        let start = unsafe { NonNull::new_unchecked(span.start as *mut u8) };
        self.pages
            .protect(start, span.len, protection)
            .map_err(|source| Error::Os { operation, source })?;

        self.ledger().record(&span, protection);
        log::trace!("{}: {operation} on {len} bytes at {ptr:p}", self.name);
        Ok(())
    }

    #[inline]
    fn ensure_active(&self, operation: Operation) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed {
                operation,
                allocator: self.name.clone(),
            });
        }

        Ok(())
    }

    #[inline]
    fn violation(operation: Operation, reason: &'static str) -> Error {
        Error::PreconditionViolation { operation, reason }
    }

    // The ledger is consistent between statements, a panic cannot leave it torn.
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProtectedMemoryAllocator {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ProtectedMemoryAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectedMemoryAllocator")
            .field("name", &self.name)
            .field("heap_size", &self.heap_size)
            .field("minimum_allocation_size", &self.minimum_allocation_size)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> ProtectedMemoryAllocator {
        ProtectedMemoryAllocator::new(32000, 128).expect("Failed to new(..)")
    }

    #[test]
    fn test_alloc_charges_minimum_allocation_size() {
        let allocator = allocator();

        let ptr = allocator.alloc(4).expect("Failed to alloc(..)");
        assert_eq!(allocator.outstanding_bytes(), 128);
        assert_eq!(allocator.outstanding_allocations(), 1);

        allocator.free(ptr, 4).expect("Failed to free(..)");
        assert_eq!(allocator.outstanding_bytes(), 0);
        assert_eq!(allocator.outstanding_allocations(), 0);
    }

    #[test]
    fn test_alloc_zero_is_a_precondition_violation() {
        let allocator = allocator();

        let result = allocator.alloc(0);
        assert!(matches!(
            result,
            Err(Error::PreconditionViolation {
                operation: Operation::Alloc,
                ..
            })
        ));
        assert_eq!(allocator.outstanding_bytes(), 0);
    }

    #[test]
    fn test_alloc_at_heap_size_then_exhausted() {
        let allocator = allocator();

        let ptr = allocator.alloc(32000).expect("boundary allocation failed");
        let result = allocator.alloc(1);
        assert!(matches!(result, Err(Error::AllocationFailed { requested: 1, .. })));

        allocator.free(ptr, 32000).expect("Failed to free(..)");
        let ptr = allocator.alloc(1).expect("allocation after free failed");
        allocator.free(ptr, 1).expect("Failed to free(..)");
    }

    #[test]
    fn test_alloc_above_heap_size_fails() {
        let allocator = allocator();

        let result = allocator.alloc(32001);
        assert!(matches!(result, Err(Error::AllocationFailed { .. })));
        assert_eq!(allocator.outstanding_bytes(), 0);
    }

    #[test]
    fn test_alloc_of_unmappable_length_fails() {
        let allocator = allocator();

        for len in [isize::MAX as usize, usize::MAX] {
            let result = allocator.alloc(len);
            assert!(
                matches!(result, Err(Error::AllocationFailed { requested, .. }) if requested == len),
                "alloc({len}) returned {result:?}"
            );
        }
        assert_eq!(allocator.outstanding_bytes(), 0);
        assert_eq!(allocator.outstanding_allocations(), 0);
    }

    #[test]
    fn test_free_unknown_or_mismatched_region() {
        let allocator = allocator();
        let ptr = allocator.alloc(16).expect("Failed to alloc(..)");

        let result = allocator.free(NonNull::dangling(), 16);
        assert!(matches!(result, Err(Error::PreconditionViolation { .. })));

        let result = allocator.free(ptr, 15);
        assert!(matches!(result, Err(Error::PreconditionViolation { .. })));

        allocator.free(ptr, 16).expect("Failed to free(..)");

        let result = allocator.free(ptr, 16);
        assert!(matches!(
            result,
            Err(Error::PreconditionViolation {
                operation: Operation::Free,
                ..
            })
        ));
    }

    #[test]
    fn test_protection_state_follows_transitions() {
        let allocator = allocator();
        let ptr = allocator.alloc(8).expect("Failed to alloc(..)");
        assert_eq!(allocator.protection(ptr).ok().flatten(), Some(Protection::ReadWrite));

        allocator.set_no_access(ptr, 8).expect("Failed to set_no_access(..)");
        assert_eq!(allocator.protection(ptr).ok().flatten(), Some(Protection::NoAccess));

        allocator.set_read_access(ptr, 8).expect("Failed to set_read_access(..)");
        assert_eq!(allocator.protection(ptr).ok().flatten(), Some(Protection::ReadOnly));
        assert_eq!(unsafe { ptr.as_ptr().read() }, 0);

        allocator
            .set_read_write_access(ptr, 8)
            .expect("Failed to set_read_write_access(..)");
        assert_eq!(allocator.protection(ptr).ok().flatten(), Some(Protection::ReadWrite));

        allocator.free(ptr, 8).expect("Failed to free(..)");
    }

    #[test]
    fn test_set_access_outside_region_is_rejected() {
        let allocator = allocator();
        let ptr = allocator.alloc(8).expect("Failed to alloc(..)");

        let result = allocator.set_no_access(ptr, 9);
        assert!(matches!(
            result,
            Err(Error::PreconditionViolation {
                operation: Operation::SetNoAccess,
                ..
            })
        ));

        let result = allocator.set_read_access(NonNull::dangling(), 1);
        assert!(matches!(result, Err(Error::PreconditionViolation { .. })));

        allocator.free(ptr, 8).expect("Failed to free(..)");
    }

    #[test]
    fn test_free_of_no_access_region_succeeds() {
        let allocator = allocator();
        let ptr = allocator.alloc(32).expect("Failed to alloc(..)");

        allocator.set_no_access(ptr, 32).expect("Failed to set_no_access(..)");
        allocator.free(ptr, 32).expect("Failed to free(..)");
    }

    #[test]
    fn test_name_carries_data_model() {
        let allocator = allocator();

        assert!(allocator.name().contains("MemoryAllocator"));
        assert!(allocator.name().ends_with(DataModel::NATIVE.as_str()));
        #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
        assert_eq!(allocator.name(), "LinuxProtectedMemoryAllocatorLP64");
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let result = ProtectedMemoryAllocator::new(128, 32000);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));

        let result = ProtectedMemoryAllocator::new(32000, 0);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_dispose_with_outstanding_allocation() {
        let allocator = allocator();
        let ptr = allocator.alloc(4).expect("Failed to alloc(..)");

        allocator.dispose();
        assert!(allocator.is_disposed());
        assert!(allocator.free(ptr, 4).is_err_and(|e| e.is_disposed()));
        assert_eq!(allocator.outstanding_allocations(), 1);
    }

    #[test]
    fn test_concurrent_alloc_free_on_distinct_regions() {
        let allocator = ProtectedMemoryAllocator::new(64 * 1024, 64).expect("Failed to new(..)");

        std::thread::scope(|scope| {
            for thread in 0..4u8 {
                let allocator = &allocator;
                scope.spawn(move || {
                    for _ in 0..16 {
                        let ptr = allocator.alloc(64).expect("Failed to alloc(..)");
                        let bytes = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), 64) };
                        bytes.fill(thread);
                        assert!(bytes.iter().all(|&b| b == thread));
                        allocator.free(ptr, 64).expect("Failed to free(..)");
                    }
                });
            }
        });

        assert_eq!(allocator.outstanding_bytes(), 0);
    }
}
