//! VMK Memory Management
//!
//! This crate implements user-space virtual-memory management for a
//! minimal kernel: tracking of a process's mapped virtual regions,
//! on-demand physical-page binding, protection changes, unmapping, and
//! copy-on-write propagation across fork-style process duplication.
//!
//! The surrounding kernel is consumed through the narrow traits in
//! `vmk-api` (frame pool, TLB flush, fork hooks); the scheduler, the
//! physical allocator's free lists and the trap dispatcher live outside
//! this crate.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// Re-export API types
pub use vmk_api::*;

// Memory management modules
pub mod fault;
pub mod fork;
pub mod frame;
pub mod layout;
pub mod page_table;
pub mod space;
pub mod vma;

// Re-export commonly used types
pub use fault::FaultCause;
pub use fork::{fork_address_space, fork_process};
pub use layout::VmLayout;
pub use page_table::{PageTableEntry, PteFlags};
pub use space::AddressSpace;
pub use vma::{Region, RegionList};
