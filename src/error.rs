use core::fmt;
use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Allocator operations, as they appear in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Alloc,
    Free,
    SetNoAccess,
    SetReadAccess,
    SetReadWriteAccess,
    GetRlimitCoreResource,
    ResourceLimits,
    Protection,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alloc => "Alloc",
            Self::Free => "Free",
            Self::SetNoAccess => "SetNoAccess",
            Self::SetReadAccess => "SetReadAccess",
            Self::SetReadWriteAccess => "SetReadWriteAccess",
            Self::GetRlimitCoreResource => "GetRlimitCoreResource",
            Self::ResourceLimits => "ResourceLimits",
            Self::Protection => "Protection",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the protected memory allocator.
#[derive(Debug, Error)]
pub enum Error {
    /// The allocator was constructed with parameters it cannot honour.
    #[error("invalid allocator configuration: {0}")]
    InvalidConfiguration(String),

    /// The OS refused to reserve or lock the region, or the heap is exhausted.
    #[error("failed to allocate {requested} protected bytes: {source}")]
    AllocationFailed {
        requested: usize,
        #[source]
        source: io::Error,
    },

    /// The allocator was used after `dispose`.
    #[error("Called {operation} on disposed {allocator}")]
    Disposed {
        operation: Operation,
        allocator: String,
    },

    /// The address/length pair does not describe a live allocation.
    #[error("{operation}: {reason}")]
    PreconditionViolation {
        operation: Operation,
        reason: &'static str,
    },

    /// A protection change or release failed at the OS level.
    #[error("{operation} failed: {source}")]
    Os {
        operation: Operation,
        #[source]
        source: io::Error,
    },

    /// The operation has no equivalent on this platform.
    #[error("{operation} is not supported on this platform")]
    Unsupported { operation: Operation },
}

impl Error {
    /// Returns `true` if the error was caused by using a disposed allocator.
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed { .. })
    }
}
