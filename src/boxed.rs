use core::{fmt, marker::PhantomData, mem::ManuallyDrop, ptr::NonNull};
use std::sync::Arc;

use zeroize::Zeroize;

use crate::{
    error::Result,
    marker::{Locked, Unlocked},
    ProtectedMemoryAllocator,
};

/// A secure container for storing secret value.
///
/// This structure is designed for scenarios where you need to
/// securely store sensitive information, such as cryptographic keys,
/// passwords, or other sensitive data.
///
/// The bytes live in a region of a [`ProtectedMemoryAllocator`]: locked into
/// RAM, excluded from core dumps and surrounded by guard pages. A
/// `SecretBox<Locked>` keeps its region inaccessible and only opens it for the
/// duration of [`with_bytes`](SecretBox::with_bytes) or
/// [`with_bytes_mut`](SecretBox::with_bytes_mut). A `SecretBox<Unlocked>` is
/// read/write until it is locked again.
///
/// Dropping the box wipes and releases the region.
pub struct SecretBox<S = Locked> {
    allocator: Arc<ProtectedMemoryAllocator>,
    ptr: NonNull<u8>,
    len: usize,
    _state: PhantomData<S>,
}

// The region is exclusively owned by the box and every access goes through `&mut self`
unsafe impl<S> Send for SecretBox<S> {}
unsafe impl<S> Sync for SecretBox<S> {}

impl SecretBox<Locked> {
    /// Allocates a zero-filled secret of `len` bytes.
    pub fn new(allocator: Arc<ProtectedMemoryAllocator>, len: usize) -> Result<Self> {
        let ptr = allocator.alloc(len)?;
        let this = Self {
            allocator,
            ptr,
            len,
            _state: PhantomData,
        };

        // On failure `this` is dropped, freeing the region
        this.allocator.set_no_access(this.ptr, this.len)?;
        Ok(this)
    }

    /// Moves `bytes` into a new secret, wiping the source slice.
    pub fn from_slice(allocator: Arc<ProtectedMemoryAllocator>, bytes: &mut [u8]) -> Result<Self> {
        let result = Self::new(allocator, bytes.len()).and_then(|mut this| {
            this.with_bytes_mut(|dst| dst.copy_from_slice(bytes))?;
            Ok(this)
        });

        bytes.zeroize();
        result
    }

    /// Runs `f` with read-only access to the secret.
    ///
    /// The region is inaccessible again once `f` returns or panics.
    pub fn with_bytes<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.allocator.set_read_access(self.ptr, self.len)?;
        let relock = Relock::new(&self.allocator, self.ptr, self.len);

        let result = f(unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) });
        relock.finish()?;

        Ok(result)
    }

    /// Runs `f` with read/write access to the secret.
    ///
    /// The region is inaccessible again once `f` returns or panics.
    pub fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.allocator.set_read_write_access(self.ptr, self.len)?;
        let relock = Relock::new(&self.allocator, self.ptr, self.len);

        let result = f(unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) });
        relock.finish()?;

        Ok(result)
    }

    /// Opens the region for reading and writing.
    pub fn unlock(self) -> Result<SecretBox<Unlocked>> {
        // Calls the `self` destructor on failure, freeing the region
        self.allocator.set_read_write_access(self.ptr, self.len)?;
        Ok(self.into_state())
    }
}

impl SecretBox<Unlocked> {
    /// Makes the region inaccessible again.
    pub fn lock(self) -> Result<SecretBox<Locked>> {
        self.allocator.set_no_access(self.ptr, self.len)?;
        Ok(self.into_state())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.as_ref()
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.as_mut()
    }
}

impl<S> SecretBox<S> {
    /// Returns the length of the secret in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn into_state<T>(self) -> SecretBox<T> {
        let this = ManuallyDrop::new(self);
        SecretBox {
            // `this` is never dropped, the allocator handle is moved out exactly once
            allocator: unsafe { core::ptr::read(&this.allocator) },
            ptr: this.ptr,
            len: this.len,
            _state: PhantomData,
        }
    }
}

/// Makes a region inaccessible again when dropped, even while unwinding.
struct Relock<'a> {
    allocator: &'a ProtectedMemoryAllocator,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'a> Relock<'a> {
    fn new(allocator: &'a ProtectedMemoryAllocator, ptr: NonNull<u8>, len: usize) -> Self {
        Self { allocator, ptr, len }
    }

    /// Relocks the region, reporting the failure instead of logging it.
    fn finish(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        this.allocator.set_no_access(this.ptr, this.len)
    }
}

impl Drop for Relock<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.allocator.set_no_access(self.ptr, self.len) {
            log::error!("failed to relock {} secret bytes: {error}", self.len);
        }
    }
}

impl AsRef<[u8]> for SecretBox<Unlocked> {
    fn as_ref(&self) -> &[u8] {
        let slice_ptr = core::ptr::slice_from_raw_parts(self.ptr.as_ptr(), self.len);
        unsafe { &(*slice_ptr) }
    }
}

impl AsMut<[u8]> for SecretBox<Unlocked> {
    fn as_mut(&mut self) -> &mut [u8] {
        let slice_ptr = core::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        unsafe { &mut (*slice_ptr) }
    }
}

impl<S> Drop for SecretBox<S> {
    fn drop(&mut self) {
        if let Err(error) = self.allocator.free(self.ptr, self.len) {
            log::error!("failed to free {} secret bytes: {error}", self.len);
        }
    }
}

impl<S> fmt::Debug for SecretBox<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBox")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
