//! Page-fault classification and resolution
//!
//! Invoked by the external trap dispatcher. A fault is either resolved
//! (lazy zero-fill binding, or CoW privatization) or rejected with
//! `SegmentationFault`, which the trap layer turns into a fatal signal.
//! The handler never retries internally.

use vmk_api::{FrameKind, FrameSource, Result, TlbFlush, VirtAddr, VmError};

use crate::frame;
use crate::page_table::{self, PageTableEntry};
use crate::space::AddressSpace;

/// Hardware error code for a read of a non-present page.
pub const ERR_CODE_READ: u64 = 0x4;
/// Hardware error code for a write to a non-present page.
pub const ERR_CODE_WRITE: u64 = 0x6;
/// Hardware error code for a write protection violation.
pub const ERR_CODE_PROT: u64 = 0x7;

/// Classified cause of a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    /// Read access to a non-present page
    NotPresentRead,
    /// Write access to a non-present page
    NotPresentWrite,
    /// Write access to a present page without write permission
    ProtectionWrite,
}

impl FaultCause {
    /// Decode the hardware-supplied error code.
    pub fn from_error_code(code: u64) -> Option<Self> {
        match code {
            ERR_CODE_READ => Some(Self::NotPresentRead),
            ERR_CODE_WRITE => Some(Self::NotPresentWrite),
            ERR_CODE_PROT => Some(Self::ProtectionWrite),
            _ => None,
        }
    }

    /// Whether the faulting access was a write.
    pub fn is_write(self) -> bool {
        matches!(self, Self::NotPresentWrite | Self::ProtectionWrite)
    }
}

/// Resolve a page fault at `addr`.
///
/// Classification:
/// - no region covers the address (or the sentinel does): illegal
///   access;
/// - protection-violation write on a read-only region: illegal write;
///   on a writable region: a CoW break, delegated to the resolver;
/// - not-present access: a write to a read-only region is illegal,
///   anything else binds a zero-filled frame with the region's
///   writability.
pub fn handle_fault<E: FrameSource + TlbFlush>(
    env: &mut E,
    space: &mut AddressSpace,
    addr: VirtAddr,
    cause: FaultCause,
) -> Result<()> {
    let region = match space.regions().find_containing(addr) {
        Some(region) if !region.is_sentinel() => *region,
        _ => {
            log::debug!("fault: no region covers {:#x}", addr.as_usize());
            return Err(VmError::SegmentationFault);
        }
    };

    if cause.is_write() && !region.protection.is_writable() {
        log::debug!("fault: write to read-only region at {:#x}", addr.as_usize());
        return Err(VmError::SegmentationFault);
    }

    match cause {
        FaultCause::ProtectionWrite => resolve_cow_fault(env, space, addr),
        FaultCause::NotPresentRead | FaultCause::NotPresentWrite => {
            let slot = page_table::walk_create(env, space.root(), addr)?;
            if !slot.get(env).is_present() {
                let new = frame::alloc_zeroed(env, FrameKind::User)?;
                slot.set(
                    env,
                    PageTableEntry::leaf(new, region.protection.is_writable()),
                );
                env.invalidate(addr);
                log::trace!(
                    "fault: bound frame {:?} at {:#x}",
                    new,
                    addr.page_base().as_usize()
                );
            }
            Ok(())
        }
    }
}

/// Privatize the page behind a CoW write fault.
///
/// A frame still shared with another mapping is copied into a fresh
/// frame bound writable; the last owner of a frame reclaims it in place
/// by restoring the writable bit.
pub fn resolve_cow_fault<E: FrameSource + TlbFlush>(
    env: &mut E,
    space: &mut AddressSpace,
    addr: VirtAddr,
) -> Result<()> {
    let slot =
        page_table::lookup(env, space.root(), addr).ok_or(VmError::SegmentationFault)?;
    let entry = slot.get(env);
    if !entry.is_present() {
        return Err(VmError::SegmentationFault);
    }

    let old = entry.frame();
    if env.refcount(old) > 1 {
        let new = env.alloc(FrameKind::User).ok_or(VmError::OutOfMemory)?;
        frame::copy_frame(env, old, new);
        slot.set(env, PageTableEntry::leaf(new, true));
        frame::release(env, FrameKind::User, old);
        log::trace!(
            "cow: privatized {:#x} ({:?} -> {:?})",
            addr.page_base().as_usize(),
            old,
            new
        );
    } else {
        slot.set(env, entry.with_writable(true));
        log::trace!("cow: reclaimed sole frame {:?} at {:#x}", old, addr.as_usize());
    }
    env.invalidate(addr);
    Ok(())
}
