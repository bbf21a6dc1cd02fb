//! Address-space duplication for fork
//!
//! The child inherits the parent's region list verbatim and a CoW view
//! of every bound page: both sides end up with read-only leaves over the
//! shared frames, and the first write on either side privatizes through
//! the fault path. Unbound pages stay unbound and fault lazily in
//! whichever process touches them first.

use alloc::vec::Vec;

use vmk_api::{FrameSource, PAGE_SIZE, ProcessHooks, Result, TlbFlush, VirtAddr};

use crate::frame;
use crate::page_table;
use crate::space::AddressSpace;

/// Mirror `parent`'s user mappings into `child` under CoW.
///
/// `child` must be freshly created and empty; its region list is
/// replaced wholesale.
pub fn fork_address_space<E: FrameSource + TlbFlush>(
    env: &mut E,
    parent: &mut AddressSpace,
    child: &mut AddressSpace,
) -> Result<()> {
    child.regions = parent.regions.clone();

    let ranges: Vec<(usize, usize)> = parent
        .regions
        .user_regions()
        .map(|region| (region.start, region.end))
        .collect();

    for (start, end) in ranges {
        let mut addr = start;
        while addr < end {
            let vaddr = VirtAddr::new(addr);
            share_page(env, parent, child, vaddr)?;
            addr += PAGE_SIZE;
        }
    }
    log::debug!(
        "mm: forked address space, root {:?} -> {:?}",
        parent.root(),
        child.root()
    );
    Ok(())
}

/// Share one bound page between parent and child.
///
/// The parent's leaf is downgraded to read-only in place; the child gets
/// an identical read-only leaf over the same frame, which gains one
/// count unit. Absent leaves are left absent on both sides. The child
/// walk runs before any mutation: if its table allocation fails, the
/// parent entry and the frame count are untouched.
fn share_page<E: FrameSource + TlbFlush>(
    env: &mut E,
    parent: &mut AddressSpace,
    child: &mut AddressSpace,
    vaddr: VirtAddr,
) -> Result<()> {
    let Some(parent_slot) = page_table::lookup(env, parent.root(), vaddr) else {
        return Ok(());
    };
    let entry = parent_slot.get(env);
    if !entry.is_present() {
        return Ok(());
    }

    let child_slot = page_table::walk_create(env, child.root(), vaddr)?;

    frame::retain(env, entry.frame());
    let shared = entry.with_writable(false);
    parent_slot.set(env, shared);
    env.invalidate(vaddr);
    child_slot.set(env, shared);
    Ok(())
}

/// Fork a process: duplicate the address space, then run the process
/// bookkeeping that depends on the duplicated memory image.
pub fn fork_process<E: FrameSource + TlbFlush, H: ProcessHooks>(
    env: &mut E,
    parent: &mut AddressSpace,
    child: &mut AddressSpace,
    hooks: &mut H,
) -> Result<()> {
    fork_address_space(env, parent, child)?;
    hooks.copy_kernel_tables(parent.root(), child.root());
    hooks.duplicate_file_descriptors();
    hooks.finalize_child();
    Ok(())
}
