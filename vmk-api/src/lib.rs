//! VMK API
//!
//! This crate provides the core types and interfaces of the VMK
//! virtual-memory core: address and frame newtypes, protection flags,
//! the common error type, and the narrow traits through which the
//! surrounding kernel is consumed (frame allocator, TLB, process hooks).

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod interfaces;
pub mod types;

// Re-export commonly used types and functions
pub use error::{Result, VmError};
pub use interfaces::{FrameSource, ProcessHooks, TlbFlush};
pub use types::{
    FrameId, FrameKind, Protection, RawFrame, VirtAddr, PAGE_SHIFT, PAGE_SIZE, PT_ENTRIES,
    PT_LEVELS, page_round_down, page_round_up,
};
