//! The physical memory manager (§4.1).
//!
//! Maintains an address-sorted, non-overlapping list of typed ranges
//! covering the machine's physical address space. The design document
//! describes this as a doubly-linked list; a `Vec` kept sorted gives the
//! same externally observable behavior (and the same invariants) with far
//! less unsafe code, which is the implementation this crate picks.
//!
//! Note on `alloc`'s return type: the design's `alloc` returns a
//! `(virt, phys)` pair because the reference loader always runs under an
//! identity (or fixed-offset) mapping of all physical memory. That mapping
//! is itself architecture/firmware-specific, so here `alloc` returns only
//! the physical address; a caller that needs to write through it obtains a
//! writable view via an arch-provided direct-map contract.

use alloc::vec::Vec;

use super::{AllocFlags, MemKind, PhysAddr, LOADER_PHYS_MAX, PAGE_SIZE};
use crate::error::MemoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    start: PhysAddr,
    size: u64,
    kind: MemKind,
}

impl Range {
    fn end(&self) -> PhysAddr {
        self.start + self.size
    }
}

/// The physical memory map: a sorted, non-overlapping, coalesced list of
/// typed ranges.
#[derive(Debug, Default)]
pub struct MemoryMap {
    ranges: Vec<Range>,
}

/// A published, immutable snapshot of the final memory map, handed to
/// `image::tags` for `KBOOT_TAG_MEMORY` emission (§4.8(p)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedRange {
    pub start: PhysAddr,
    pub size: u64,
    pub kind: MemKind,
}

impl MemoryMap {
    #[must_use]
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Inserts a range, splitting or overwriting whatever it overlaps,
    /// then coalescing with same-typed neighbors.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidAlignment`] if `start` or `size` is
    /// not page-aligned, or if `size` is zero.
    pub fn add(&mut self, start: PhysAddr, size: u64, kind: MemKind) -> Result<(), MemoryError> {
        if size == 0 || !start.is_aligned(PAGE_SIZE) || !super::is_aligned(size, PAGE_SIZE) {
            return Err(MemoryError::InvalidAlignment);
        }

        let new = Range { start, size, kind };
        let new_end = new.end();

        let mut result: Vec<Range> = Vec::with_capacity(self.ranges.len() + 2);
        for existing in &self.ranges {
            if existing.end() <= new.start || existing.start >= new_end {
                result.push(*existing);
                continue;
            }
            if existing.start < new.start {
                result.push(Range {
                    start: existing.start,
                    size: new.start - existing.start,
                    kind: existing.kind,
                });
            }
            if existing.end() > new_end {
                result.push(Range {
                    start: new_end,
                    size: existing.end() - new_end,
                    kind: existing.kind,
                });
            }
        }
        result.push(new);
        result.sort_by_key(|r| r.start.as_u64());
        self.ranges = result;
        self.coalesce();
        Ok(())
    }

    fn coalesce(&mut self) {
        let mut merged: Vec<Range> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.kind == r.kind && last.end() == r.start {
                    last.size += r.size;
                    continue;
                }
            }
            merged.push(r);
        }
        self.ranges = merged;
    }

    /// Finds a `Free` sub-range of `size` bytes, aligned to `align`, within
    /// `[min, max]`, and overwrites it with `kind`. See §4.1.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::NoMemory`] if no such range exists.
    pub fn alloc(
        &mut self,
        size: u64,
        align: u64,
        min: Option<PhysAddr>,
        max: Option<PhysAddr>,
        kind: MemKind,
        flags: AllocFlags,
    ) -> Result<PhysAddr, MemoryError> {
        let align = if align == 0 { PAGE_SIZE } else { align };
        let min = min.unwrap_or(PhysAddr::new(PAGE_SIZE));
        let max = max.unwrap_or(PhysAddr::new(LOADER_PHYS_MAX));

        let candidate = if flags.high {
            self.find_fit_high(size, align, min, max)
        } else {
            self.find_fit_low(size, align, min, max)
        };

        let chosen = candidate.ok_or(MemoryError::NoMemory)?;
        self.add(chosen, size, kind)?;
        Ok(chosen)
    }

    fn find_fit_low(&self, size: u64, align: u64, min: PhysAddr, max: PhysAddr) -> Option<PhysAddr> {
        for r in &self.ranges {
            if r.kind != MemKind::Free {
                continue;
            }
            if let Some(addr) = Self::fit_in_range(r, size, align, min, max) {
                return Some(addr);
            }
        }
        None
    }

    fn find_fit_high(&self, size: u64, align: u64, min: PhysAddr, max: PhysAddr) -> Option<PhysAddr> {
        for r in self.ranges.iter().rev() {
            if r.kind != MemKind::Free {
                continue;
            }
            if let Some(addr) = Self::fit_in_range_high(r, size, align, min, max) {
                return Some(addr);
            }
        }
        None
    }

    fn fit_in_range(r: &Range, size: u64, align: u64, min: PhysAddr, max: PhysAddr) -> Option<PhysAddr> {
        let lo = r.start.max(min);
        let aligned = lo.align_up(align);
        if aligned.as_u64() < lo.as_u64() {
            return None; // overflow on align_up
        }
        let end = aligned + size;
        if end.as_u64() > r.end().as_u64() || end.as_u64() > max.as_u64() {
            return None;
        }
        Some(aligned)
    }

    fn fit_in_range_high(r: &Range, size: u64, align: u64, min: PhysAddr, max: PhysAddr) -> Option<PhysAddr> {
        let lo = r.start.max(min).as_u64();
        let want_end = r.end().as_u64();
        // `max` is an inclusive bound; add 1 to get an exclusive bound
        // without overflowing when `max == u64::MAX` (the default, "no
        // upper bound" case).
        let capped_end = if max.as_u64() == u64::MAX {
            want_end
        } else {
            want_end.min(max.as_u64() + 1)
        };
        let candidate_start = capped_end.checked_sub(size)?;
        let aligned_start = super::align_down(candidate_start, align);
        if aligned_start < lo {
            return None;
        }
        Some(PhysAddr::new(aligned_start))
    }

    /// Marks every currently-`Free` sub-range within `[start, start+size)`
    /// as `Internal`, reserving it from further allocation without yet
    /// deciding its final type. Reversed by [`finalize`](Self::finalize).
    pub fn protect(&mut self, start: PhysAddr, size: u64) {
        let end = start + size;
        let free_subranges: Vec<(PhysAddr, u64)> = self
            .ranges
            .iter()
            .filter(|r| r.kind == MemKind::Free)
            .filter_map(|r| {
                let lo = r.start.max(start);
                let hi = r.end().min(end);
                (hi.as_u64() > lo.as_u64()).then_some((lo, hi.as_u64() - lo.as_u64()))
            })
            .collect();

        for (addr, sz) in free_subranges {
            let _ = self.add(addr, sz, MemKind::Internal);
        }
    }

    /// Reclassifies every `Internal` range back to `Free`, coalesces, and
    /// returns the final published map (§4.8(p)).
    pub fn finalize(&mut self) -> Vec<PublishedRange> {
        for r in &mut self.ranges {
            if r.kind == MemKind::Internal {
                r.kind = MemKind::Free;
            }
        }
        self.coalesce();
        self.ranges
            .iter()
            .map(|r| PublishedRange {
                start: r.start,
                size: r.size,
                kind: r.kind,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(v: u64) -> PhysAddr {
        PhysAddr::new(v)
    }

    #[test]
    fn add_coalesces_adjacent_same_type() {
        let mut m = MemoryMap::new();
        m.add(addr(0x0), 0x1000, MemKind::Free).unwrap();
        m.add(addr(0x1000), 0x1000, MemKind::Free).unwrap();
        assert_eq!(m.ranges.len(), 1);
        assert_eq!(m.ranges[0].size, 0x2000);
    }

    #[test]
    fn add_rejects_unaligned() {
        let mut m = MemoryMap::new();
        assert_eq!(
            m.add(addr(0x1), 0x1000, MemKind::Free),
            Err(MemoryError::InvalidAlignment)
        );
        assert_eq!(
            m.add(addr(0x0), 0x0, MemKind::Free),
            Err(MemoryError::InvalidAlignment)
        );
    }

    /// S5 from §8: a single free range, high alloc picks the top, low
    /// alloc picks the bottom, and the remaining free middle shrinks.
    #[test]
    fn scenario_s5_high_then_low_alloc() {
        let mut m = MemoryMap::new();
        m.add(addr(0x100000), 0x100000, MemKind::Free).unwrap();

        let high = m
            .alloc(0x10000, 0x10000, None, None, MemKind::Allocated, AllocFlags::HIGH)
            .unwrap();
        assert_eq!(high, addr(0x1F0000));

        let low = m
            .alloc(0x10000, 0x10000, None, None, MemKind::Allocated, AllocFlags::NONE)
            .unwrap();
        assert_eq!(low, addr(0x100000));
    }

    #[test]
    fn alloc_respects_min_max() {
        let mut m = MemoryMap::new();
        m.add(addr(0x0), 0x100000, MemKind::Free).unwrap();
        let r = m.alloc(
            0x1000,
            0x1000,
            Some(addr(0x50000)),
            Some(addr(0x60000)),
            MemKind::Allocated,
            AllocFlags::NONE,
        );
        assert_eq!(r, Ok(addr(0x50000)));
    }

    #[test]
    fn alloc_no_memory() {
        let mut m = MemoryMap::new();
        m.add(addr(0x0), 0x1000, MemKind::Free).unwrap();
        let r = m.alloc(0x2000, 0x1000, None, None, MemKind::Allocated, AllocFlags::NONE);
        assert_eq!(r, Err(MemoryError::NoMemory));
    }

    #[test]
    fn protect_finalize_round_trip() {
        let mut m = MemoryMap::new();
        m.add(addr(0x0), 0x3000, MemKind::Free).unwrap();
        m.protect(addr(0x1000), 0x1000);
        assert!(m.ranges.iter().any(|r| r.kind == MemKind::Internal));

        let published = m.finalize();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, MemKind::Free);
        assert_eq!(published[0].size, 0x3000);
    }

    #[test]
    fn invariant_sorted_non_overlapping_after_random_ops() {
        let mut m = MemoryMap::new();
        m.add(addr(0x0), 0x10000, MemKind::Free).unwrap();
        m.alloc(0x1000, 0x1000, None, None, MemKind::Allocated, AllocFlags::NONE)
            .unwrap();
        m.alloc(0x1000, 0x1000, None, None, MemKind::Stack, AllocFlags::HIGH)
            .unwrap();
        m.protect(addr(0x2000), 0x1000);
        let _ = m.finalize();

        let mut prev_end: Option<u64> = None;
        for r in &m.ranges {
            if let Some(pe) = prev_end {
                assert!(r.start.as_u64() >= pe);
            }
            prev_end = Some(r.end().as_u64());
        }
    }
}
