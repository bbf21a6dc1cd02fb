//! Error handling for the VMK virtual-memory core

use core::fmt;

/// Common error type for virtual-memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Bad length, protection or flag combination
    InvalidArgument,
    /// Fixed placement collides with an existing region or falls
    /// outside the mapping window
    AddressUnavailable,
    /// No hole in the mapping window is large enough
    OutOfAddressSpace,
    /// Frame or page-table allocation exhausted
    OutOfMemory,
    /// Fault on an unmapped or illegally-accessed address
    SegmentationFault,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InvalidArgument => write!(f, "invalid argument"),
            VmError::AddressUnavailable => write!(f, "address unavailable"),
            VmError::OutOfAddressSpace => write!(f, "out of address space"),
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::SegmentationFault => write!(f, "segmentation fault"),
        }
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, VmError>;
