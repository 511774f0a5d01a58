use std::sync::OnceLock;

#[cfg(target_family = "unix")]
pub mod unix;
#[cfg(target_family = "windows")]
pub mod windows;

/// Retrieves the system's page size.
///
/// # Platform-specific behavior
/// - **Unix-based systems (Linux, macOS, etc.):**
///   - On macOS, this function uses `libc::vm_page_size` to determine the page size.
///   - On other Unix systems, it uses `libc::sysconf` to get the page size.
///
/// - **Windows:** The function retrieves the page size by calling `GetSystemInfo`
///   and extracting the `dwPageSize` field from the `SYSTEM_INFO` structure.
///
/// # Returns
///
/// * The size of a memory page in bytes.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    #[cfg(target_family = "unix")]
    {
        *PAGE_SIZE.get_or_init(self::unix::page_size)
    }
    #[cfg(target_family = "windows")]
    {
        *PAGE_SIZE.get_or_init(self::windows::page_size)
    }
}

/// Soft and hard values of a process resource limit, in bytes.
///
/// `None` stands for an unlimited value (`RLIM_INFINITY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

impl Rlimit {
    /// Returns `true` if the soft limit forbids the resource entirely.
    pub fn is_zero(&self) -> bool {
        self.soft == Some(0)
    }
}

/// Snapshot of the resource limits that matter for secret-bearing memory.
///
/// Fields are `None` when the platform has no such limit or it could not be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum size of a core dump written for this process.
    pub core_dump: Option<Rlimit>,
    /// Maximum number of bytes this process may lock into RAM.
    pub locked_memory: Option<Rlimit>,
}

impl ResourceLimits {
    /// Returns `true` if the process is known not to write core dumps.
    pub fn core_dumps_disabled(&self) -> bool {
        self.core_dump.map_or(false, |limit| limit.is_zero())
    }
}
