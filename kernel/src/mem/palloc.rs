//! Page allocator for the user pool. Frames are carved out of one
//! page-aligned arena and tracked with a bitmap.

use crate::sync::mutex::Mutex;
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use bitflags::bitflags;
use bitvec::prelude::*;
use core::ptr::write_bytes;
use marrowos_shared::mem::PAGE_FRAME_SIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PalFlags: u8 {
        /// Allocate from the user pool.
        const USER = 1 << 0;
        /// Zero the page before returning it.
        const ZERO = 1 << 1;
    }
}

/// The pool of physical pages handed to user processes. `get_page` returns
/// the page's kernel virtual address.
pub struct UserPool {
    base: *mut u8,
    frames: usize,
    used: Mutex<BitVec>,
}

// SAFETY: The arena is owned by the pool for its whole lifetime and the
// bitmap never hands out the same page twice.
unsafe impl Send for UserPool {}
unsafe impl Sync for UserPool {}

impl UserPool {
    pub fn new(frames: usize) -> Self {
        assert!(frames > 0, "user pool must hold at least one frame");
        let layout = Self::layout(frames);
        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "user pool arena allocation failed");
        Self {
            base,
            frames,
            used: Mutex::new(bitvec![0; frames]),
        }
    }

    fn layout(frames: usize) -> Layout {
        Layout::from_size_align(frames * PAGE_FRAME_SIZE, PAGE_FRAME_SIZE)
            .expect("bad user pool layout")
    }

    /// Obtains a free page and returns its kernel virtual address, or `None`
    /// if the pool is exhausted.
    pub fn get_page(&self, flags: PalFlags) -> Option<usize> {
        let mut used = self.used.lock();
        let index = used.iter_zeros().next()?;
        used.set(index, true);
        drop(used);

        let kva = self.base as usize + index * PAGE_FRAME_SIZE;
        if flags.contains(PalFlags::ZERO) {
            // SAFETY: kva addresses one whole frame inside the arena.
            unsafe { write_bytes(kva as *mut u8, 0, PAGE_FRAME_SIZE) };
        }
        Some(kva)
    }

    /// Returns the page at `kva` to the pool.
    pub fn free_page(&self, kva: usize) {
        let offset = kva
            .checked_sub(self.base as usize)
            .expect("freeing a page outside the user pool");
        assert_eq!(offset % PAGE_FRAME_SIZE, 0, "freeing an unaligned page");
        let index = offset / PAGE_FRAME_SIZE;
        assert!(index < self.frames, "freeing a page outside the user pool");

        let mut used = self.used.lock();
        assert!(used[index], "double free of user page");
        used.set(index, false);
    }

    /// Total frames in the pool.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Frames not currently handed out.
    pub fn free_frames(&self) -> usize {
        self.used.lock().count_zeros()
    }
}

impl Drop for UserPool {
    fn drop(&mut self) {
        // SAFETY: base came from alloc_zeroed with the same layout.
        unsafe { dealloc(self.base, Self::layout(self.frames)) };
    }
}
