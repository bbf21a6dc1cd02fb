//! Dynamic-mapping address window configuration
//!
//! The core manages a single configuration-supplied window of the user
//! address space in which `map` may place regions. The first page of the
//! window is reserved for the sentinel region and never handed out.

use static_assertions::const_assert;
use vmk_api::{PAGE_SIZE, VirtAddr};

/// Default window start (6 GiB).
pub const MMAP_WINDOW_START: usize = 0x1_8000_0000;
/// Default window end, exclusive (8 GiB).
pub const MMAP_WINDOW_END: usize = 0x2_0000_0000;

const_assert!(MMAP_WINDOW_START % PAGE_SIZE == 0);
const_assert!(MMAP_WINDOW_END % PAGE_SIZE == 0);
const_assert!(MMAP_WINDOW_START + PAGE_SIZE < MMAP_WINDOW_END);

/// Address-window configuration for one address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmLayout {
    /// First address of the dynamic mapping window
    pub window_start: usize,
    /// One past the last address of the dynamic mapping window
    pub window_end: usize,
}

impl VmLayout {
    /// Creates a layout over the given half-open window.
    ///
    /// Both bounds must be page-aligned and leave room for the sentinel
    /// page plus at least one mappable page.
    pub const fn new(window_start: usize, window_end: usize) -> Self {
        assert!(window_start % PAGE_SIZE == 0);
        assert!(window_end % PAGE_SIZE == 0);
        assert!(window_start + PAGE_SIZE < window_end);
        Self {
            window_start,
            window_end,
        }
    }

    /// Window size in bytes.
    pub const fn window_len(&self) -> usize {
        self.window_end - self.window_start
    }

    /// Start of the sentinel page.
    pub const fn sentinel_start(&self) -> usize {
        self.window_start
    }

    /// End of the sentinel page (first mappable address).
    pub const fn sentinel_end(&self) -> usize {
        self.window_start + PAGE_SIZE
    }

    /// Check if an address lies inside the mapping window.
    #[inline]
    pub const fn contains(&self, addr: VirtAddr) -> bool {
        addr.as_usize() >= self.window_start && addr.as_usize() < self.window_end
    }

    /// Check if a half-open range lies entirely inside the window.
    #[inline]
    pub const fn contains_range(&self, start: usize, end: usize) -> bool {
        start >= self.window_start && end <= self.window_end && start < end
    }
}

impl Default for VmLayout {
    fn default() -> Self {
        Self::new(MMAP_WINDOW_START, MMAP_WINDOW_END)
    }
}
