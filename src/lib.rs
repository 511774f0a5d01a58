//! Guarded, page-locked memory for cryptographic secrets.
//!
//! [`ProtectedMemoryAllocator`] hands out regions that are locked into RAM,
//! excluded from core dumps, surrounded by inaccessible guard pages and wiped
//! before they are released. [`SecretBox`] is an owning handle over one such
//! region that keeps it inaccessible while idle.
//!
//! ```no_run
//! use std::sync::Arc;
//! use protected_mem::{ProtectedMemoryAllocator, SecretBox};
//!
//! let allocator = Arc::new(ProtectedMemoryAllocator::new(32000, 128)?);
//! let mut key = *b"super-secret-key";
//!
//! let mut secret = SecretBox::from_slice(allocator, &mut key)?;
//! secret.with_bytes(|bytes| assert_eq!(bytes, b"super-secret-key"))?;
//! # Ok::<(), protected_mem::Error>(())
//! ```

mod alloc;
mod allocator;
mod boxed;
mod config;
mod error;
mod ledger;
mod util;

pub mod marker {
    /// Marker type indicating that a secret container is in a locked state,
    /// where the contents cannot be read or modified.
    pub enum Locked {}

    /// Marker type indicating that a secret container is in an unlocked state,
    /// allowing modification of the contents.
    pub enum Unlocked {}
}

pub use alloc::{DataModel, Protection, ResourceLimits, Rlimit};
pub use allocator::ProtectedMemoryAllocator;
pub use boxed::SecretBox;
pub use config::{Backing, Config};
pub use error::{Error, Operation, Result};
