//! Region interval list (VMA tracking)
//!
//! Maintains the ordered, non-overlapping set of mapped intervals for one
//! address space. The list is keyed by start address in a `BTreeMap`, so
//! predecessor/successor queries are tree lookups. A sentinel region with
//! empty protection occupies the first page of the mapping window; it is
//! never removable and, because its protection equals no valid request,
//! never coalesces with a user region.
//!
//! Invariants after every mutation:
//! - regions are pairwise non-overlapping and sorted by start;
//! - no two contiguous regions share the same protection;
//! - every region is page-aligned, non-empty and inside the window.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use vmk_api::{PAGE_SIZE, Protection, Result, VirtAddr, VmError};

use crate::layout::VmLayout;

/// A contiguous virtual memory region with one protection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Start address (page-aligned)
    pub start: usize,
    /// End address (exclusive, page-aligned)
    pub end: usize,
    /// Protection mode; empty for the sentinel
    pub protection: Protection,
}

impl Region {
    /// Create a new region.
    #[must_use]
    pub fn new(start: usize, end: usize, protection: Protection) -> Self {
        debug_assert!(start < end, "region start must be < end");
        debug_assert!(start % PAGE_SIZE == 0, "region start must be page-aligned");
        debug_assert!(end % PAGE_SIZE == 0, "region end must be page-aligned");
        Self {
            start,
            end,
            protection,
        }
    }

    /// Length of the region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// A region is never empty by construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Check if an address falls within this region.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Half-open interval intersection; touching is not overlap.
    #[must_use]
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }

    /// Whether this is the sentinel region.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.protection.is_empty()
    }
}

/// Ordered region list for one address space.
#[derive(Debug, Clone)]
pub struct RegionList {
    layout: VmLayout,
    /// Regions keyed by start address
    regions: BTreeMap<usize, Region>,
}

impl RegionList {
    /// Create a region list over the given window, with the sentinel
    /// occupying the window's first page.
    #[must_use]
    pub fn new(layout: VmLayout) -> Self {
        let mut regions = BTreeMap::new();
        let sentinel = Region::new(
            layout.sentinel_start(),
            layout.sentinel_end(),
            Protection::empty(),
        );
        regions.insert(sentinel.start, sentinel);
        Self { layout, regions }
    }

    /// The window this list manages.
    #[must_use]
    pub fn layout(&self) -> &VmLayout {
        &self.layout
    }

    /// Number of regions, sentinel included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// The list always holds at least the sentinel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate over all regions in ascending order, sentinel included.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Iterate over user regions (sentinel excluded) in ascending order.
    pub fn user_regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values().filter(|r| !r.is_sentinel())
    }

    /// Find the region containing the given address.
    #[must_use]
    pub fn find_containing(&self, addr: VirtAddr) -> Option<&Region> {
        let (_, region) = self.regions.range(..=addr.as_usize()).next_back()?;
        region.contains(addr.as_usize()).then_some(region)
    }

    fn overlaps_any(&self, start: usize, end: usize) -> bool {
        // Only the predecessor and the regions starting before `end`
        // can intersect a half-open range.
        if let Some((_, prev)) = self.regions.range(..start).next_back()
            && prev.overlaps(start, end)
        {
            return true;
        }
        self.regions
            .range(start..end)
            .next()
            .is_some()
    }

    /// Choose a placement for a `size`-byte region.
    ///
    /// `size` must already be page-rounded. Fixed placement validates the
    /// exact range; a non-fixed hint is honored when it fits disjointly
    /// inside the window; otherwise the ascending gaps between regions
    /// are scanned first-fit, ending with the gap after the last region.
    pub fn find_hole(&self, size: usize, hint: usize, fixed: bool) -> Result<usize> {
        debug_assert!(size > 0 && size % PAGE_SIZE == 0);

        if fixed {
            let end = hint.checked_add(size).ok_or(VmError::AddressUnavailable)?;
            if !self.layout.contains_range(hint, end) || self.overlaps_any(hint, end) {
                return Err(VmError::AddressUnavailable);
            }
            return Ok(hint);
        }

        if hint != 0
            && let Some(end) = hint.checked_add(size)
            && self.layout.contains_range(hint, end)
            && !self.overlaps_any(hint, end)
        {
            return Ok(hint);
        }

        // First-fit over the gaps between consecutive regions. The
        // sentinel pins the scan past the window's first page.
        let mut cursor = self.layout.window_start;
        for region in self.regions.values() {
            if region.start.saturating_sub(cursor) >= size {
                return Ok(cursor);
            }
            cursor = region.end;
        }
        if self.layout.window_end.saturating_sub(cursor) >= size {
            return Ok(cursor);
        }
        Err(VmError::OutOfAddressSpace)
    }

    /// Insert a region at `start` and coalesce with contiguous
    /// equal-protection neighbors.
    ///
    /// The caller must have chosen `start` via [`RegionList::find_hole`];
    /// overlap here is a logic error.
    pub fn insert(&mut self, start: usize, size: usize, protection: Protection) {
        debug_assert!(size > 0 && size % PAGE_SIZE == 0);
        debug_assert!(!self.overlaps_any(start, start + size));

        let mut new = Region::new(start, start + size, protection);

        // Merge with successor
        if let Some((&succ_key, succ)) = self.regions.range(new.end..).next()
            && succ.start == new.end
            && succ.protection == new.protection
        {
            new.end = succ.end;
            self.regions.remove(&succ_key);
        }

        // Merge with predecessor
        if let Some((&pred_key, pred)) = self.regions.range(..new.start).next_back()
            && pred.end == new.start
            && pred.protection == new.protection
        {
            new.start = pred.start;
            self.regions.remove(&pred_key);
        }

        log::trace!(
            "vma: insert [{:#x}, {:#x}) prot={:?}",
            new.start,
            new.end,
            new.protection
        );
        self.regions.insert(new.start, new);
    }

    /// Remove every part of the list intersecting `[start, end)`.
    ///
    /// Fully covered regions are deleted; partially covered ones are
    /// trimmed or split. The sentinel is never touched. Removal cannot
    /// create new equal-protection adjacency, so no merge pass runs.
    pub fn remove_range(&mut self, start: usize, end: usize) {
        debug_assert!(start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0);

        for (key, region) in self.take_overlapping(start, end) {
            debug_assert_eq!(key, region.start);
            if region.start < start {
                // Left remainder keeps the old protection
                let left = Region::new(region.start, start, region.protection);
                self.regions.insert(left.start, left);
            }
            if region.end > end {
                // Right remainder
                let right = Region::new(end, region.end, region.protection);
                self.regions.insert(right.start, right);
            }
        }
        log::trace!("vma: removed [{:#x}, {:#x})", start, end);
    }

    /// Re-protect every part of the list intersecting `[start, end)`.
    ///
    /// The intersecting sub-range of each region takes `protection`; up
    /// to two leftover fragments keep the old one. A full adjacency-merge
    /// pass then restores the coalescing invariant.
    pub fn set_protection(&mut self, start: usize, end: usize, protection: Protection) {
        debug_assert!(start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0);

        for (_, region) in self.take_overlapping(start, end) {
            let mid_start = region.start.max(start);
            let mid_end = region.end.min(end);
            if region.start < mid_start {
                let left = Region::new(region.start, mid_start, region.protection);
                self.regions.insert(left.start, left);
            }
            let mid = Region::new(mid_start, mid_end, protection);
            self.regions.insert(mid.start, mid);
            if region.end > mid_end {
                let right = Region::new(mid_end, region.end, region.protection);
                self.regions.insert(right.start, right);
            }
        }
        self.merge_adjacent();
        log::trace!(
            "vma: reprotected [{:#x}, {:#x}) to {:?}",
            start,
            end,
            protection
        );
    }

    /// Detach every non-sentinel region overlapping `[start, end)`.
    fn take_overlapping(&mut self, start: usize, end: usize) -> Vec<(usize, Region)> {
        let keys: Vec<usize> = self
            .regions
            .values()
            .filter(|r| !r.is_sentinel() && r.overlaps(start, end))
            .map(|r| r.start)
            .collect();
        keys.into_iter()
            .filter_map(|k| self.regions.remove(&k).map(|r| (k, r)))
            .collect()
    }

    /// Coalesce contiguous equal-protection neighbors over the whole list.
    fn merge_adjacent(&mut self) {
        let mut cursor = self.layout.window_start;
        while let Some((&key, &region)) = self.regions.range(cursor..).next() {
            let succ = self.regions.range(region.end..).next().map(|(_, r)| *r);
            match succ {
                Some(s) if s.start == region.end && s.protection == region.protection => {
                    // Re-examine the grown region; a chain of contiguous
                    // equal-protection neighbors collapses in one pass.
                    self.regions.remove(&s.start);
                    self.regions
                        .insert(key, Region::new(region.start, s.end, region.protection));
                }
                _ => cursor = region.end,
            }
        }
    }

    /// Check the structural invariants: sorted disjoint page-aligned
    /// regions inside the window, no contiguous equal-protection pair,
    /// sentinel present and first.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let mut prev: Option<&Region> = None;
        for region in self.regions.values() {
            if region.is_empty()
                || region.start % PAGE_SIZE != 0
                || region.end % PAGE_SIZE != 0
                || region.start < self.layout.window_start
                || region.end > self.layout.window_end
            {
                return false;
            }
            if let Some(p) = prev {
                if p.end > region.start {
                    return false;
                }
                if p.end == region.start && p.protection == region.protection {
                    return false;
                }
            }
            prev = Some(region);
        }
        self.regions
            .first_key_value()
            .is_some_and(|(_, r)| r.is_sentinel() && r.start == self.layout.sentinel_start())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{MMAP_WINDOW_START, VmLayout};
    use proptest::prelude::*;

    const RW: Protection = Protection::read_write();
    const RO: Protection = Protection::READ;

    fn base() -> usize {
        // First mappable address, just past the sentinel page
        MMAP_WINDOW_START + PAGE_SIZE
    }

    fn list() -> RegionList {
        RegionList::new(VmLayout::default())
    }

    fn user(list: &RegionList) -> Vec<Region> {
        list.user_regions().copied().collect()
    }

    #[test]
    fn test_new_list_has_sentinel() {
        let l = list();
        assert_eq!(l.len(), 1);
        assert!(l.iter().next().unwrap().is_sentinel());
        assert!(l.is_consistent());
    }

    #[test]
    fn test_first_fit_skips_sentinel() {
        let l = list();
        assert_eq!(l.find_hole(PAGE_SIZE, 0, false).unwrap(), base());
    }

    #[test]
    fn test_find_hole_between_regions() {
        let mut l = list();
        l.insert(base(), PAGE_SIZE, RW);
        l.insert(base() + 3 * PAGE_SIZE, PAGE_SIZE, RW);

        // One-page hole between the two regions fits a one-page request
        assert_eq!(l.find_hole(2 * PAGE_SIZE, 0, false).unwrap(), base() + PAGE_SIZE);
        // A larger request falls through to the gap after the last region
        assert_eq!(
            l.find_hole(4 * PAGE_SIZE, 0, false).unwrap(),
            base() + 4 * PAGE_SIZE
        );
    }

    #[test]
    fn test_hint_honored_when_free() {
        let mut l = list();
        l.insert(base(), PAGE_SIZE, RW);
        let hint = base() + 16 * PAGE_SIZE;
        assert_eq!(l.find_hole(PAGE_SIZE, hint, false).unwrap(), hint);
        // Colliding hint falls back to first fit
        assert_eq!(l.find_hole(PAGE_SIZE, base(), false).unwrap(), base() + PAGE_SIZE);
    }

    #[test]
    fn test_fixed_placement() {
        let mut l = list();
        l.insert(base(), 2 * PAGE_SIZE, RW);

        assert_eq!(
            l.find_hole(PAGE_SIZE, base() + 4 * PAGE_SIZE, true).unwrap(),
            base() + 4 * PAGE_SIZE
        );
        // Collision
        assert_eq!(
            l.find_hole(PAGE_SIZE, base() + PAGE_SIZE, true),
            Err(VmError::AddressUnavailable)
        );
        // Sentinel page is not available for fixed placement
        assert_eq!(
            l.find_hole(PAGE_SIZE, MMAP_WINDOW_START, true),
            Err(VmError::AddressUnavailable)
        );
        // Outside the window
        assert_eq!(
            l.find_hole(PAGE_SIZE, 0x1000, true),
            Err(VmError::AddressUnavailable)
        );
    }

    #[test]
    fn test_window_exhaustion() {
        let l = list();
        let too_big = l.layout().window_len();
        assert_eq!(l.find_hole(too_big, 0, false), Err(VmError::OutOfAddressSpace));
    }

    #[test]
    fn test_insert_coalesces_with_both_neighbors() {
        let mut l = list();
        l.insert(base(), PAGE_SIZE, RW);
        l.insert(base() + 2 * PAGE_SIZE, PAGE_SIZE, RW);
        assert_eq!(user(&l).len(), 2);

        // Filling the gap fuses all three
        l.insert(base() + PAGE_SIZE, PAGE_SIZE, RW);
        let regions = user(&l);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start, base());
        assert_eq!(regions[0].end, base() + 3 * PAGE_SIZE);
        assert!(l.is_consistent());
    }

    #[test]
    fn test_insert_no_merge_across_protection() {
        let mut l = list();
        l.insert(base(), PAGE_SIZE, RO);
        l.insert(base() + PAGE_SIZE, PAGE_SIZE, RW);
        assert_eq!(user(&l).len(), 2);
        assert!(l.is_consistent());
    }

    #[test]
    fn test_no_merge_with_sentinel() {
        let mut l = list();
        // Adjacent to the sentinel page, but the sentinel never coalesces
        l.insert(base(), PAGE_SIZE, RW);
        assert_eq!(l.len(), 2);
        assert!(l.is_consistent());
    }

    #[test]
    fn test_remove_whole_region() {
        let mut l = list();
        l.insert(base(), 2 * PAGE_SIZE, RW);
        l.remove_range(base(), base() + 2 * PAGE_SIZE);
        assert!(user(&l).is_empty());
        assert!(l.is_consistent());
    }

    #[test]
    fn test_remove_splits_interior() {
        let mut l = list();
        l.insert(base(), 3 * PAGE_SIZE, RW);
        l.remove_range(base() + PAGE_SIZE, base() + 2 * PAGE_SIZE);

        let regions = user(&l);
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].start, regions[0].end), (base(), base() + PAGE_SIZE));
        assert_eq!(
            (regions[1].start, regions[1].end),
            (base() + 2 * PAGE_SIZE, base() + 3 * PAGE_SIZE)
        );
        assert!(l.is_consistent());
    }

    #[test]
    fn test_remove_trims_and_spans_regions() {
        let mut l = list();
        l.insert(base(), 2 * PAGE_SIZE, RW);
        l.insert(base() + 2 * PAGE_SIZE, 2 * PAGE_SIZE, RO);

        // Range covers the tail of the first and the head of the second
        l.remove_range(base() + PAGE_SIZE, base() + 3 * PAGE_SIZE);
        let regions = user(&l);
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].start, regions[0].end), (base(), base() + PAGE_SIZE));
        assert_eq!(regions[0].protection, RW);
        assert_eq!(
            (regions[1].start, regions[1].end),
            (base() + 3 * PAGE_SIZE, base() + 4 * PAGE_SIZE)
        );
        assert_eq!(regions[1].protection, RO);
        assert!(l.is_consistent());
    }

    #[test]
    fn test_remove_nothing_is_noop() {
        let mut l = list();
        l.insert(base(), PAGE_SIZE, RW);
        l.remove_range(base() + 8 * PAGE_SIZE, base() + 9 * PAGE_SIZE);
        assert_eq!(user(&l).len(), 1);
    }

    #[test]
    fn test_set_protection_interior_split() {
        let mut l = list();
        l.insert(base(), 3 * PAGE_SIZE, RW);
        l.set_protection(base() + PAGE_SIZE, base() + 2 * PAGE_SIZE, RO);

        let regions = user(&l);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].protection, RW);
        assert_eq!(regions[1].protection, RO);
        assert_eq!(regions[2].protection, RW);
        assert!(regions.iter().all(|r| r.len() == PAGE_SIZE));
        assert!(l.is_consistent());
    }

    #[test]
    fn test_set_protection_merges_after() {
        let mut l = list();
        l.insert(base(), PAGE_SIZE, RO);
        l.insert(base() + PAGE_SIZE, PAGE_SIZE, RW);

        // Re-protecting the RW page to RO fuses the pair
        l.set_protection(base() + PAGE_SIZE, base() + 2 * PAGE_SIZE, RO);
        let regions = user(&l);
        assert_eq!(regions.len(), 1);
        assert_eq!((regions[0].start, regions[0].end), (base(), base() + 2 * PAGE_SIZE));
        assert!(l.is_consistent());
    }

    #[test]
    fn test_set_protection_spanning_regions() {
        let mut l = list();
        l.insert(base(), 2 * PAGE_SIZE, RW);
        l.insert(base() + 2 * PAGE_SIZE, 2 * PAGE_SIZE, RO);

        l.set_protection(base() + PAGE_SIZE, base() + 3 * PAGE_SIZE, RW);
        let regions = user(&l);
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].start, regions[0].end), (base(), base() + 3 * PAGE_SIZE));
        assert_eq!(regions[0].protection, RW);
        assert_eq!(regions[1].protection, RO);
        assert!(l.is_consistent());
    }

    #[test]
    fn test_find_containing() {
        let mut l = list();
        l.insert(base(), PAGE_SIZE, RW);
        assert!(l.find_containing(VirtAddr::new(base())).is_some());
        assert!(l.find_containing(VirtAddr::new(base() + PAGE_SIZE - 1)).is_some());
        assert!(l.find_containing(VirtAddr::new(base() + PAGE_SIZE)).is_none());
        // The sentinel page is covered by the sentinel region
        assert!(
            l.find_containing(VirtAddr::new(MMAP_WINDOW_START))
                .unwrap()
                .is_sentinel()
        );
    }

    // Property: arbitrary op sequences preserve the list invariants.
    #[derive(Debug, Clone)]
    enum Op {
        Map { pages: usize, prot: Protection },
        Unmap { page: usize, pages: usize },
        Protect { page: usize, pages: usize, prot: Protection },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let prot = prop_oneof![Just(RO), Just(RW)];
        prop_oneof![
            (1usize..8, prot.clone()).prop_map(|(pages, prot)| Op::Map { pages, prot }),
            (0usize..64, 1usize..8).prop_map(|(page, pages)| Op::Unmap { page, pages }),
            (0usize..64, 1usize..8, prot)
                .prop_map(|(page, pages, prot)| Op::Protect { page, pages, prot }),
        ]
    }

    proptest! {
        #[test]
        fn prop_invariants_hold(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let mut l = list();
            for op in ops {
                match op {
                    Op::Map { pages, prot } => {
                        if let Ok(start) = l.find_hole(pages * PAGE_SIZE, 0, false) {
                            l.insert(start, pages * PAGE_SIZE, prot);
                        }
                    }
                    Op::Unmap { page, pages } => {
                        let start = base() + page * PAGE_SIZE;
                        l.remove_range(start, start + pages * PAGE_SIZE);
                    }
                    Op::Protect { page, pages, prot } => {
                        let start = base() + page * PAGE_SIZE;
                        l.set_protection(start, start + pages * PAGE_SIZE, prot);
                    }
                }
                prop_assert!(l.is_consistent());
            }
        }
    }
}
