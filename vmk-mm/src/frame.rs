//! Physical-frame ownership discipline
//!
//! Reference counts live with the external frame pool; this module
//! enforces the discipline around them: one present leaf entry per count
//! unit, and a frame is returned to the pool exactly once, at the 1 -> 0
//! transition. A fresh allocation's initial count of one belongs to its
//! first mapping.

use core::ptr;

use vmk_api::{FrameId, FrameKind, FrameSource, PAGE_SIZE, Result, VmError};

/// Allocate a zero-filled frame from the given pool region.
pub fn alloc_zeroed<E: FrameSource>(env: &mut E, kind: FrameKind) -> Result<FrameId> {
    let frame = env.alloc(kind).ok_or(VmError::OutOfMemory)?;
    zero_frame(env, frame);
    Ok(frame)
}

/// Zero a frame's contents.
pub fn zero_frame(env: &impl FrameSource, frame: FrameId) {
    // Frame contents are raw pool-owned memory.
    unsafe { ptr::write_bytes(env.frame_ptr(frame).as_ptr(), 0, PAGE_SIZE) };
}

/// Copy one frame's contents into another.
pub fn copy_frame(env: &impl FrameSource, src: FrameId, dst: FrameId) {
    debug_assert_ne!(src, dst);
    let src_ptr = env.frame_ptr(src).as_ptr() as *const u8;
    let dst_ptr = env.frame_ptr(dst).as_ptr();
    unsafe { ptr::copy_nonoverlapping(src_ptr, dst_ptr, PAGE_SIZE) };
}

/// Add one mapping's worth of ownership to a frame.
pub fn retain<E: FrameSource>(env: &mut E, frame: FrameId) {
    env.incref(frame);
}

/// Drop one mapping's worth of ownership; the frame goes back to the
/// pool when the last mapping disappears.
///
/// A release on a zero count indicates a caller bug upstream; it is
/// logged and ignored rather than corrupting the pool with a double
/// free.
pub fn release<E: FrameSource>(env: &mut E, kind: FrameKind, frame: FrameId) {
    if env.refcount(frame) == 0 {
        log::warn!("frame: release of {:?} with zero refcount", frame);
        return;
    }
    if env.decref(frame) == 0 {
        env.free(kind, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;
    use hashbrown::HashMap;
    use vmk_api::RawFrame;

    /// Minimal pool for exercising the count discipline.
    #[derive(Default)]
    struct MiniPool {
        pages: HashMap<u64, Box<RawFrame>>,
        counts: HashMap<u64, u32>,
        next: u64,
        freed: Vec<FrameId>,
    }

    impl FrameSource for MiniPool {
        fn alloc(&mut self, _kind: FrameKind) -> Option<FrameId> {
            self.next += 1;
            let id = self.next;
            self.pages.insert(id, Box::new(RawFrame::zeroed()));
            self.counts.insert(id, 1);
            Some(FrameId::new(id))
        }

        fn free(&mut self, _kind: FrameKind, frame: FrameId) {
            self.pages.remove(&frame.as_u64());
            self.counts.remove(&frame.as_u64());
            self.freed.push(frame);
        }

        fn incref(&mut self, frame: FrameId) {
            *self.counts.get_mut(&frame.as_u64()).unwrap() += 1;
        }

        fn decref(&mut self, frame: FrameId) -> u32 {
            let count = self.counts.get_mut(&frame.as_u64()).unwrap();
            *count -= 1;
            *count
        }

        fn refcount(&self, frame: FrameId) -> u32 {
            self.counts.get(&frame.as_u64()).copied().unwrap_or(0)
        }

        fn frame_ptr(&self, frame: FrameId) -> NonNull<u8> {
            let page = self.pages.get(&frame.as_u64()).unwrap();
            NonNull::new(page.0.as_ptr() as *mut u8).unwrap()
        }
    }

    #[test]
    fn test_release_frees_at_zero() {
        let mut pool = MiniPool::default();
        let frame = alloc_zeroed(&mut pool, FrameKind::User).unwrap();
        assert_eq!(pool.refcount(frame), 1);

        release(&mut pool, FrameKind::User, frame);
        assert_eq!(pool.freed, vec![frame]);
    }

    #[test]
    fn test_shared_frame_survives_one_release() {
        let mut pool = MiniPool::default();
        let frame = alloc_zeroed(&mut pool, FrameKind::User).unwrap();
        retain(&mut pool, frame);
        assert_eq!(pool.refcount(frame), 2);

        release(&mut pool, FrameKind::User, frame);
        assert_eq!(pool.refcount(frame), 1);
        assert!(pool.freed.is_empty());

        release(&mut pool, FrameKind::User, frame);
        assert_eq!(pool.freed, vec![frame]);
    }

    #[test]
    fn test_release_on_zero_count_is_noop() {
        let mut pool = MiniPool::default();
        let frame = alloc_zeroed(&mut pool, FrameKind::User).unwrap();
        release(&mut pool, FrameKind::User, frame);
        // The frame is gone; a second release must not free twice.
        release(&mut pool, FrameKind::User, frame);
        assert_eq!(pool.freed, vec![frame]);
    }

    #[test]
    fn test_alloc_zeroed_zeroes() {
        let mut pool = MiniPool::default();
        let frame = alloc_zeroed(&mut pool, FrameKind::User).unwrap();
        let ptr = pool.frame_ptr(frame).as_ptr();
        for offset in [0usize, 1, PAGE_SIZE / 2, PAGE_SIZE - 1] {
            assert_eq!(unsafe { *ptr.add(offset) }, 0);
        }
    }

    #[test]
    fn test_copy_frame() {
        let mut pool = MiniPool::default();
        let src = alloc_zeroed(&mut pool, FrameKind::User).unwrap();
        let dst = alloc_zeroed(&mut pool, FrameKind::User).unwrap();
        unsafe { *pool.frame_ptr(src).as_ptr().add(17) = 0xAB };

        copy_frame(&pool, src, dst);
        assert_eq!(unsafe { *pool.frame_ptr(dst).as_ptr().add(17) }, 0xAB);
    }
}
