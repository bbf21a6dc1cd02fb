//! Per-process address space and the mapping operations
//!
//! An [`AddressSpace`] pairs a process's region list with its page-table
//! root. The mapping operations keep the two mutually consistent: `map`
//! only reserves an interval (frames bind lazily on first fault),
//! `unmap` tears hardware state down before editing the list, and
//! `mprotect` rewrites leaf permissions before re-tagging the list.
//!
//! Every operation takes its collaborators explicitly; there is no
//! ambient process-context lookup.

use vmk_api::{
    FrameId, FrameKind, FrameSource, PAGE_SIZE, Protection, Result, TlbFlush, VirtAddr, VmError,
    page_round_up,
};

use crate::frame;
use crate::layout::VmLayout;
use crate::page_table;
use crate::vma::RegionList;

/// One process's virtual address space.
#[derive(Debug)]
pub struct AddressSpace {
    pub(crate) root: FrameId,
    pub(crate) regions: RegionList,
}

impl AddressSpace {
    /// Create an empty address space with a fresh page-table root.
    pub fn new<E: FrameSource>(env: &mut E, layout: VmLayout) -> Result<Self> {
        let root = frame::alloc_zeroed(env, FrameKind::PageTable)?;
        Ok(Self {
            root,
            regions: RegionList::new(layout),
        })
    }

    /// Page-table root frame.
    #[must_use]
    pub fn root(&self) -> FrameId {
        self.root
    }

    /// The region list.
    #[must_use]
    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    fn validate_range(&self, addr: VirtAddr, length: usize) -> Result<usize> {
        if length == 0 || length > self.regions.layout().window_len() {
            return Err(VmError::InvalidArgument);
        }
        if !addr.is_page_aligned() {
            return Err(VmError::InvalidArgument);
        }
        addr.as_usize()
            .checked_add(page_round_up(length))
            .ok_or(VmError::InvalidArgument)
    }

    /// Reserve a region of `length` bytes.
    ///
    /// Placement follows the hint rules of the region list; no leaf
    /// entries are populated here, binding is deferred to the fault
    /// handler. Returns the chosen start address.
    pub fn map(
        &mut self,
        addr_hint: VirtAddr,
        length: usize,
        protection: Protection,
        fixed: bool,
    ) -> Result<VirtAddr> {
        if length == 0 || length > self.regions.layout().window_len() {
            return Err(VmError::InvalidArgument);
        }
        if !protection.is_valid_request() {
            return Err(VmError::InvalidArgument);
        }
        if fixed && (addr_hint.as_usize() == 0 || !addr_hint.is_page_aligned()) {
            return Err(VmError::InvalidArgument);
        }

        let size = page_round_up(length);
        let hint = if fixed {
            addr_hint.as_usize()
        } else {
            addr_hint.page_base().as_usize()
        };
        let start = self.regions.find_hole(size, hint, fixed)?;
        self.regions.insert(start, size, protection);
        log::debug!(
            "mm: map [{:#x}, {:#x}) prot={:?} fixed={}",
            start,
            start + size,
            protection,
            fixed
        );
        Ok(VirtAddr::new(start))
    }

    /// Tear down every mapping in `[addr, addr + length)` and drop the
    /// covered parts of the region list.
    ///
    /// Frames whose count reaches zero go back to the pool; intermediate
    /// tables left empty are compacted away. A range with no mapped
    /// region is not an error.
    pub fn unmap<E: FrameSource + TlbFlush>(
        &mut self,
        env: &mut E,
        addr: VirtAddr,
        length: usize,
    ) -> Result<()> {
        let end = self.validate_range(addr, length)?;

        // Hardware teardown keys off the address range, not off list
        // node identity, so it runs before the list mutation.
        page_table::teardown_range(env, self.root, addr, VirtAddr::new(end));
        page_table::prune_empty_tables(env, self.root);
        self.regions.remove_range(addr.as_usize(), end);
        log::debug!("mm: unmap [{:#x}, {:#x})", addr.as_usize(), end);
        Ok(())
    }

    /// Change the protection of `[addr, addr + length)`.
    ///
    /// Already-bound leaves have their writable bit rewritten first;
    /// a shared frame being relaxed to writable is privatized so the
    /// other owners keep their CoW view. The region list is re-tagged
    /// afterwards.
    pub fn mprotect<E: FrameSource + TlbFlush>(
        &mut self,
        env: &mut E,
        addr: VirtAddr,
        length: usize,
        protection: Protection,
    ) -> Result<()> {
        let end = self.validate_range(addr, length)?;
        if !protection.is_valid_request() {
            return Err(VmError::InvalidArgument);
        }

        let mut page = addr.as_usize();
        while page < end {
            let vaddr = VirtAddr::new(page);
            if let Some(slot) = page_table::lookup(env, self.root, vaddr) {
                let entry = slot.get(env);
                if entry.is_present() {
                    self.reprotect_leaf(env, slot, entry, vaddr, protection)?;
                }
            }
            page += PAGE_SIZE;
        }

        self.regions.set_protection(addr.as_usize(), end, protection);
        log::debug!(
            "mm: mprotect [{:#x}, {:#x}) to {:?}",
            addr.as_usize(),
            end,
            protection
        );
        Ok(())
    }

    fn reprotect_leaf<E: FrameSource + TlbFlush>(
        &mut self,
        env: &mut E,
        slot: page_table::LeafSlot,
        entry: page_table::PageTableEntry,
        vaddr: VirtAddr,
        protection: Protection,
    ) -> Result<()> {
        if !protection.is_writable() {
            slot.set(env, entry.with_writable(false));
        } else {
            let old = entry.frame();
            if env.refcount(old) > 1 {
                // Shared under CoW: privatize before relaxing, or the
                // other owners would observe our writes.
                let new = env.alloc(FrameKind::User).ok_or(VmError::OutOfMemory)?;
                frame::copy_frame(env, old, new);
                slot.set(env, page_table::PageTableEntry::leaf(new, true));
                frame::release(env, FrameKind::User, old);
            } else {
                slot.set(env, entry.with_writable(true));
            }
        }
        env.invalidate(vaddr);
        Ok(())
    }
}
