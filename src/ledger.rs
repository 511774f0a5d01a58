//! Bookkeeping of live allocations.
//!
//! The ledger never touches memory, it only remembers which usable ranges
//! were handed out and how much of the heap they consume.

use std::{collections::BTreeMap, io};

use crate::{alloc::Protection, util::GuardedLayout};

#[derive(Debug, Clone)]
pub(crate) struct Region {
    /// Length requested by the caller.
    pub len: usize,
    pub layout: GuardedLayout,
    /// Heap bytes consumed, `len` rounded up to the minimum allocation size.
    pub charge: usize,
    /// `None` once only part of the region was transitioned.
    pub protection: Option<Protection>,
}

/// Page-aligned span of a single region to apply a protection change to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub base: usize,
    pub start: usize,
    pub len: usize,
    pub whole: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Ledger {
    regions: BTreeMap<usize, Region>,
    outstanding: usize,
}

impl Ledger {
    /// Charges `charge` bytes against `heap_size`.
    pub fn reserve(&mut self, charge: usize, heap_size: usize) -> io::Result<()> {
        match self.outstanding.checked_add(charge) {
            Some(total) if total <= heap_size => {
                self.outstanding = total;
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!(
                    "protected heap exhausted ({} of {heap_size} bytes in use, {charge} requested)",
                    self.outstanding
                ),
            )),
        }
    }

    pub fn refund(&mut self, charge: usize) {
        self.outstanding = self.outstanding.saturating_sub(charge);
    }

    pub fn insert(&mut self, addr: usize, region: Region) {
        self.regions.insert(addr, region);
    }

    /// Removes the region starting at `addr` and refunds its charge.
    pub fn remove(&mut self, addr: usize, len: usize) -> Result<Region, &'static str> {
        match self.regions.get(&addr) {
            None => return Err("address was not returned by this allocator"),
            Some(region) if region.len != len => {
                return Err("length does not match the allocated length")
            }
            Some(_) => {}
        }

        let region = self
            .regions
            .remove(&addr)
            .ok_or("address was not returned by this allocator")?;
        self.refund(region.charge);
        Ok(region)
    }

    /// Resolves `[addr, addr + len)` to the pages covering it.
    ///
    /// The range must be non-empty and lie inside the requested length of one region.
    pub fn span(&self, addr: usize, len: usize) -> Result<Span, &'static str> {
        if len == 0 {
            return Err("range is empty");
        }

        let (&base, region) = self
            .regions
            .range(..=addr)
            .next_back()
            .ok_or("address is not inside a live allocation")?;

        let offset = addr - base;
        match offset.checked_add(len) {
            Some(end) if end <= region.len => {
                let page_size = region.layout.page_size();
                let first = offset & !(page_size - 1);
                let last = (end + page_size - 1) & !(page_size - 1);

                Ok(Span {
                    base,
                    start: base + first,
                    len: last - first,
                    whole: first == 0 && last == region.layout.usable_len(),
                })
            }
            _ => Err("range exceeds the allocated length"),
        }
    }

    pub fn record(&mut self, span: &Span, protection: Protection) {
        if let Some(region) = self.regions.get_mut(&span.base) {
            region.protection = span.whole.then_some(protection);
        }
    }

    pub fn get(&self, addr: usize) -> Option<&Region> {
        self.regions.get(&addr)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }
}
