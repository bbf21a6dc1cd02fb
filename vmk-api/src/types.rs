//! Core address, frame and protection types

use bitflags::bitflags;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;
/// Number of translation levels in the page table
pub const PT_LEVELS: usize = 4;
/// Entries per page-table level
pub const PT_ENTRIES: usize = 512;

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the virtual address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Checks if the virtual address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Rounds down the virtual address to the containing page boundary.
    pub const fn page_base(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Get page table indices for this virtual address (4-level paging).
    ///
    /// Index fields are the four 9-bit groups above the page offset:
    /// bits 39-47, 30-38, 21-29 and 12-20, root level first.
    pub const fn table_indices(self) -> [usize; PT_LEVELS] {
        [
            (self.0 >> 39) & 0x1FF,
            (self.0 >> 30) & 0x1FF,
            (self.0 >> 21) & 0x1FF,
            (self.0 >> 12) & 0x1FF,
        ]
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for usize {
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

/// A physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameId(pub u64);

impl FrameId {
    /// Creates a new frame id from a raw frame number.
    pub const fn new(pfn: u64) -> Self {
        Self(pfn)
    }

    /// Returns the raw frame number.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Allocator region a frame is drawn from.
///
/// Intermediate page tables and user data pages come from distinct
/// regions of the physical-frame pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Frame backing an intermediate or leaf page table
    PageTable,
    /// Frame backing a user data page
    User,
}

bitflags! {
    /// Region protection flags (mmap prot values).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// Region is readable
        const READ = 1 << 0;
        /// Region is writable
        const WRITE = 1 << 1;
    }
}

impl Protection {
    /// Read-write protection.
    pub const fn read_write() -> Self {
        Self::READ.union(Self::WRITE)
    }

    /// A request protection is valid iff it is READ or READ|WRITE.
    pub fn is_valid_request(self) -> bool {
        self == Self::READ || self == Self::read_write()
    }

    /// Whether writes are permitted.
    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITE)
    }
}

/// A page-sized, page-aligned block of raw frame memory.
///
/// Used wherever frame contents are addressed as bytes (table frames,
/// zero-fill, CoW copies).
#[repr(C, align(4096))]
pub struct RawFrame(pub [u8; PAGE_SIZE]);

impl RawFrame {
    /// A zero-filled frame.
    pub const fn zeroed() -> Self {
        Self([0; PAGE_SIZE])
    }
}
