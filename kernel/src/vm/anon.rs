//! Anonymous pages. Their backing store is the swap disk: eviction writes
//! the page into a fresh slot, the next fault reads it back.

use super::frame::{FrameId, FrameTable};
use super::swap::SwapTable;
use super::AnonPage;

impl AnonPage {
    /// Brings the page's contents into the frame at `kva`. A page that was
    /// never evicted holds no slot and keeps the zeroed frame it was given.
    pub(super) fn swap_in(&mut self, swap: &SwapTable, kva: usize) -> bool {
        let Some(sec_no) = self.slot.take() else {
            return true;
        };
        // The slot goes back on the free list before its sectors are read.
        swap.free(sec_no);
        // SAFETY: kva addresses the whole frame just linked to this page.
        unsafe { swap.read_slot(sec_no, kva) };
        true
    }

    /// Writes the page out to a fresh swap slot. Panics when the swap disk
    /// is also full.
    pub(super) fn swap_out(&mut self, swap: &SwapTable, kva: usize) -> bool {
        let sec_no = swap.alloc();
        self.slot = Some(sec_no);
        // SAFETY: kva addresses the whole frame still linked to this page.
        unsafe { swap.write_slot(sec_no, kva) };
        true
    }

    /// Releases whichever of {swap slot, frame} holds the page's data.
    pub(super) fn destroy(self, frames: &FrameTable, swap: &SwapTable, frame: Option<FrameId>) {
        if let Some(sec_no) = self.slot {
            swap.free(sec_no);
        } else if let Some(id) = frame {
            frames.release(id);
        }
    }
}
