//! Collaborator interfaces consumed from the surrounding kernel
//!
//! The virtual-memory core never reaches for ambient kernel state; every
//! operation is handed the collaborators it needs through these traits.

use core::ptr::NonNull;

use crate::types::{FrameId, FrameKind, VirtAddr};

/// Trait for the physical-frame pool.
///
/// Reference counts live with the pool; the core only drives the count
/// discipline (one present leaf entry per count unit). A freshly
/// allocated frame starts with a count of one, owned by its first
/// mapping.
pub trait FrameSource {
    /// Allocates a frame from the given region, or `None` on exhaustion.
    fn alloc(&mut self, kind: FrameKind) -> Option<FrameId>;

    /// Returns a frame to the pool.
    fn free(&mut self, kind: FrameKind, frame: FrameId);

    /// Increments the frame's reference count.
    fn incref(&mut self, frame: FrameId);

    /// Decrements the frame's reference count and returns the new count.
    fn decref(&mut self, frame: FrameId) -> u32;

    /// Returns the frame's current reference count.
    fn refcount(&self, frame: FrameId) -> u32;

    /// Turns a frame number into an addressable pointer to its contents.
    ///
    /// The pointer is valid for the whole page and stays valid until the
    /// frame is returned via [`FrameSource::free`].
    fn frame_ptr(&self, frame: FrameId) -> NonNull<u8>;
}

/// Trait for the translation-cache flush primitive.
pub trait TlbFlush {
    /// Invalidates any cached translation for the given address.
    fn invalidate(&mut self, addr: VirtAddr);
}

/// Process-duplication hooks invoked after address-space duplication.
///
/// These wrap the parts of fork this core does not own: kernel-half
/// table propagation, file table duplication and child scheduling.
pub trait ProcessHooks {
    /// Copies the kernel half of the page tables from parent to child root.
    fn copy_kernel_tables(&mut self, src_root: FrameId, dst_root: FrameId);

    /// Duplicates the parent's file descriptor table into the child.
    fn duplicate_file_descriptors(&mut self);

    /// Makes the child runnable.
    fn finalize_child(&mut self);
}
