/// Rounds `value` up to the next multiple of `granule`.
///
/// Returns `None` on overflow or when `granule` is zero.
#[inline]
pub fn round_up(value: usize, granule: usize) -> Option<usize> {
    if granule == 0 {
        return None;
    }

    match value % granule {
        0 => Some(value),
        rem => value.checked_add(granule - rem),
    }
}

/// Page geometry of a guarded allocation.
///
/// ```text
/// base                                                       base + total_len
/// | guard page | usable pages (usable_len)           | guard page |
///              ^ usable_offset
/// ```
///
/// Both guard pages stay inaccessible for the whole life of the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardedLayout {
    page_size: usize,
    usable_len: usize,
}

impl GuardedLayout {
    /// Computes the layout needed to hold `len` bytes.
    ///
    /// Returns `None` if `len` is zero or the padded size overflows `isize`.
    pub fn new(len: usize, page_size: usize) -> Option<Self> {
        debug_assert!(page_size.is_power_of_two());

        if len == 0 {
            return None;
        }

        let usable_len = round_up(len, page_size)?;
        let layout = Self {
            page_size,
            usable_len,
        };

        match layout.checked_total_len() {
            Some(total) if total <= isize::MAX as usize => Some(layout),
            _ => None,
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Length of the caller-visible pages, a multiple of the page size.
    #[inline]
    pub fn usable_len(&self) -> usize {
        self.usable_len
    }

    /// Offset of the usable pages from the start of the mapping.
    #[inline]
    pub fn usable_offset(&self) -> usize {
        self.page_size
    }

    /// Length of the whole mapping, guard pages included.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.usable_len + 2 * self.page_size
    }

    fn checked_total_len(&self) -> Option<usize> {
        self.page_size
            .checked_mul(2)
            .and_then(|guards| guards.checked_add(self.usable_len))
    }
}
