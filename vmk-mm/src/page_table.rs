//! Four-level page-table entries and walker
//!
//! Tables are whole physical frames of 512 eight-byte entries, addressed
//! through [`FrameSource::frame_ptr`]. The walker descends the four
//! 9-bit index fields of a virtual address; the creating variant
//! allocates missing intermediate tables from the page-table frame
//! region, the non-creating variant stops at the first absent entry.
//!
//! Intermediate tables are never torn down eagerly; a bottom-up
//! compaction pass frees a table only once all 512 children are absent.

use core::ptr;

use bitflags::bitflags;
use static_assertions::const_assert;
use vmk_api::{
    FrameId, FrameKind, FrameSource, PAGE_SHIFT, PAGE_SIZE, PT_ENTRIES, PT_LEVELS, Result,
    TlbFlush, VirtAddr, VmError,
};

use crate::frame;

const_assert!(PT_ENTRIES * core::mem::size_of::<u64>() == PAGE_SIZE);

/// Frame-number field of an entry: 40 bits above the flag bits.
const FRAME_MASK: u64 = 0xF_FFFF_FFFF;

bitflags! {
    /// Page-table entry flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Entry is present
        const PRESENT = 1 << 0;
        /// Entry permits writes
        const WRITABLE = 1 << 1;
        /// Entry is user-accessible
        const USER = 1 << 2;
    }
}

/// A single page-table entry at any level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// The absent entry.
    pub const EMPTY: Self = Self(0);

    /// Builds an entry pointing at `frame` with the given flags.
    pub fn new(frame: FrameId, flags: PteFlags) -> Self {
        Self((frame.as_u64() << PAGE_SHIFT) | flags.bits())
    }

    /// Entry for an intermediate table: present, writable, user.
    ///
    /// Access control is enforced at the leaf; intermediate levels stay
    /// permissive so a later mprotect never has to revisit them.
    pub fn table(frame: FrameId) -> Self {
        Self::new(frame, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
    }

    /// Leaf entry mapping a user data frame.
    pub fn leaf(frame: FrameId, writable: bool) -> Self {
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        Self::new(frame, flags)
    }

    /// Flag bits of this entry.
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Referenced frame number.
    pub fn frame(self) -> FrameId {
        FrameId::new((self.0 >> PAGE_SHIFT) & FRAME_MASK)
    }

    /// Whether the entry is present.
    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Whether the entry permits writes.
    pub fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    /// The same entry with the writable bit set or cleared.
    pub fn with_writable(self, writable: bool) -> Self {
        if writable {
            Self(self.0 | PteFlags::WRITABLE.bits())
        } else {
            Self(self.0 & !PteFlags::WRITABLE.bits())
        }
    }
}

/// Mutable handle to one leaf entry, located by table frame and index.
#[derive(Debug, Clone, Copy)]
pub struct LeafSlot {
    table: FrameId,
    index: usize,
}

impl LeafSlot {
    /// Reads the entry.
    pub fn get(self, env: &impl FrameSource) -> PageTableEntry {
        read_entry(env, self.table, self.index)
    }

    /// Overwrites the entry.
    pub fn set(self, env: &impl FrameSource, entry: PageTableEntry) {
        write_entry(env, self.table, self.index, entry);
    }
}

fn read_entry(env: &impl FrameSource, table: FrameId, index: usize) -> PageTableEntry {
    debug_assert!(index < PT_ENTRIES);
    let base = env.frame_ptr(table).as_ptr() as *const u64;
    // Table frames are raw memory owned by the frame pool; entries are
    // only ever accessed through these helpers.
    unsafe { PageTableEntry(base.add(index).read()) }
}

fn write_entry(env: &impl FrameSource, table: FrameId, index: usize, entry: PageTableEntry) {
    debug_assert!(index < PT_ENTRIES);
    let base = env.frame_ptr(table).as_ptr() as *mut u64;
    unsafe { ptr::write(base.add(index), entry.0) };
}

/// Shared descent over the four translation levels.
fn descend<E: FrameSource>(
    env: &mut E,
    root: FrameId,
    vaddr: VirtAddr,
    create: bool,
) -> Result<Option<LeafSlot>> {
    let indices = vaddr.table_indices();
    let mut table = root;
    for &index in &indices[..PT_LEVELS - 1] {
        let entry = read_entry(env, table, index);
        if entry.is_present() {
            table = entry.frame();
        } else {
            if !create {
                return Ok(None);
            }
            // No rollback on later failure: an empty intermediate table
            // is harmless and gets reclaimed by the compaction pass.
            let next = env
                .alloc(FrameKind::PageTable)
                .ok_or(VmError::OutOfMemory)?;
            frame::zero_frame(env, next);
            write_entry(env, table, index, PageTableEntry::table(next));
            table = next;
        }
    }
    Ok(Some(LeafSlot {
        table,
        index: indices[PT_LEVELS - 1],
    }))
}

/// Locate the leaf entry for `vaddr`, never allocating.
///
/// Returns `None` if any intermediate level is absent.
pub fn lookup<E: FrameSource>(env: &mut E, root: FrameId, vaddr: VirtAddr) -> Option<LeafSlot> {
    match descend(env, root, vaddr, false) {
        Ok(slot) => slot,
        // The non-creating walk has no failure mode.
        Err(_) => None,
    }
}

/// Locate the leaf entry for `vaddr`, creating intermediate tables.
pub fn walk_create<E: FrameSource>(env: &mut E, root: FrameId, vaddr: VirtAddr) -> Result<LeafSlot> {
    descend(env, root, vaddr, true)?.ok_or(VmError::OutOfMemory)
}

/// Clear every present leaf in `[start, end)`, releasing the mapped
/// user frames and invalidating their translations.
pub fn teardown_range<E: FrameSource + TlbFlush>(
    env: &mut E,
    root: FrameId,
    start: VirtAddr,
    end: VirtAddr,
) {
    debug_assert!(start.is_page_aligned() && end.is_page_aligned());
    let mut addr = start.as_usize();
    while addr < end.as_usize() {
        let vaddr = VirtAddr::new(addr);
        if let Some(slot) = lookup(env, root, vaddr) {
            let entry = slot.get(env);
            if entry.is_present() {
                slot.set(env, PageTableEntry::EMPTY);
                frame::release(env, FrameKind::User, entry.frame());
                env.invalidate(vaddr);
            }
        }
        addr += PAGE_SIZE;
    }
}

/// Free intermediate tables whose 512 children are all absent,
/// bottom-up. The root table itself is never freed.
pub fn prune_empty_tables<E: FrameSource>(env: &mut E, root: FrameId) {
    prune_level(env, root, 0);
}

/// Returns true when `table` holds no present entry after pruning.
fn prune_level<E: FrameSource>(env: &mut E, table: FrameId, level: usize) -> bool {
    let mut any_present = false;
    for index in 0..PT_ENTRIES {
        let entry = read_entry(env, table, index);
        if !entry.is_present() {
            continue;
        }
        if level < PT_LEVELS - 1 && prune_level(env, entry.frame(), level + 1) {
            write_entry(env, table, index, PageTableEntry::EMPTY);
            env.free(FrameKind::PageTable, entry.frame());
            continue;
        }
        any_present = true;
    }
    !any_present
}
