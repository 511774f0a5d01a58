use crate::{
    error::{Error, Result},
    util::GuardedLayout,
};

/// Where the pages of a protected allocation come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backing {
    /// Anonymous private mapping (`mmap` on Unix, `VirtualAlloc` on Windows).
    #[default]
    Anonymous,
    /// Linux `memfd_secret` mapping, hidden from the kernel direct map.
    SecretMemory,
}

/// Construction parameters of a [`ProtectedMemoryAllocator`].
///
/// [`ProtectedMemoryAllocator`]: crate::ProtectedMemoryAllocator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Ceiling on the bytes that may be outstanding at once.
    pub heap_size: usize,
    /// Granule every request is charged in.
    pub minimum_allocation_size: usize,
    pub backing: Backing,
    /// Set `RLIMIT_CORE` to zero for the whole process on construction.
    pub disable_core_dumps: bool,
}

impl Config {
    pub const DEFAULT_HEAP_SIZE: usize = 32 * 1024;
    pub const DEFAULT_MINIMUM_ALLOCATION_SIZE: usize = 128;

    pub fn new(heap_size: usize, minimum_allocation_size: usize) -> Self {
        Self {
            heap_size,
            minimum_allocation_size,
            backing: Backing::default(),
            disable_core_dumps: false,
        }
    }

    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.backing = backing;
        self
    }

    pub fn with_core_dumps_disabled(mut self, disable: bool) -> Self {
        self.disable_core_dumps = disable;
        self
    }

    /// Checks the sizes against each other and against the page granularity.
    pub(crate) fn validate(&self, page_size: usize) -> Result<()> {
        if self.minimum_allocation_size == 0 {
            return Err(Error::InvalidConfiguration(
                "minimum allocation size must be greater than zero".to_owned(),
            ));
        }

        if self.minimum_allocation_size > self.heap_size {
            return Err(Error::InvalidConfiguration(format!(
                "minimum allocation size {} exceeds heap size {}",
                self.minimum_allocation_size, self.heap_size
            )));
        }

        if GuardedLayout::new(self.heap_size, page_size).is_none() {
            return Err(Error::InvalidConfiguration(format!(
                "heap size {} cannot be mapped with {page_size}-byte pages",
                self.heap_size
            )));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_HEAP_SIZE,
            Self::DEFAULT_MINIMUM_ALLOCATION_SIZE,
        )
    }
}
