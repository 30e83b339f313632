//! The frame table. Frames live in a slab and are referred to by stable
//! indices; the FIFO queue orders linked frames for victim selection. The
//! table's lock (`frame_lock`) is held only for list surgery, never across
//! I/O.

use crate::mem::palloc::{PalFlags, UserPool};
use crate::sync::mutex::Mutex;
use crate::threading::Pid;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

pub type FrameId = usize;

/// Back-reference from a frame to the page occupying it.
#[derive(Debug, Clone, Copy)]
pub struct FrameOwner {
    pub pid: Pid,
    pub va: usize,
}

struct Frame {
    kva: usize,
    owner: Option<FrameOwner>,
}

#[derive(Default)]
struct FrameSlab {
    slots: Vec<Option<Frame>>,
    /// Linked frames in link order; the front is the eviction candidate.
    queue: VecDeque<FrameId>,
    free_ids: Vec<FrameId>,
}

impl FrameSlab {
    fn frame(&self, id: FrameId) -> &Frame {
        self.slots[id].as_ref().expect("stale frame id")
    }

    fn frame_mut(&mut self, id: FrameId) -> &mut Frame {
        self.slots[id].as_mut().expect("stale frame id")
    }
}

pub struct FrameTable {
    pool: Arc<UserPool>,
    slab: Mutex<FrameSlab>,
}

impl FrameTable {
    pub fn new(pool: Arc<UserPool>) -> Self {
        Self {
            pool,
            slab: Mutex::new(FrameSlab::default()),
        }
    }

    /// Takes a zeroed page from the user pool and wraps it in a fresh,
    /// unlinked frame. `None` when the pool is exhausted; the caller then
    /// evicts.
    pub fn try_acquire(&self) -> Option<FrameId> {
        let kva = self.pool.get_page(PalFlags::USER | PalFlags::ZERO)?;
        let mut slab = self.slab.lock();
        let frame = Frame { kva, owner: None };
        let id = match slab.free_ids.pop() {
            Some(id) => {
                slab.slots[id] = Some(frame);
                id
            }
            None => {
                slab.slots.push(Some(frame));
                slab.slots.len() - 1
            }
        };
        Some(id)
    }

    /// Pops the oldest frame owned by `pid` off the FIFO queue and returns
    /// it with its owner link intact. Frames of other processes sharing the
    /// table, and frames still being linked, rotate to the tail.
    pub fn pop_victim(&self, pid: Pid) -> Option<(FrameId, FrameOwner)> {
        let mut slab = self.slab.lock();
        for _ in 0..slab.queue.len() {
            let id = slab.queue.pop_front()?;
            let owner = slab.frame(id).owner;
            match owner {
                Some(owner) if owner.pid == pid => return Some((id, owner)),
                _ => slab.queue.push_back(id),
            }
        }
        None
    }

    /// Records the page occupying frame `id` and queues the frame for
    /// eviction in FIFO order.
    pub fn set_owner(&self, id: FrameId, pid: Pid, va: usize) {
        let mut slab = self.slab.lock();
        slab.frame_mut(id).owner = Some(FrameOwner { pid, va });
        slab.queue.push_back(id);
    }

    /// Breaks the frame→page link of a frame already off the queue.
    pub fn clear_owner(&self, id: FrameId) {
        self.slab.lock().frame_mut(id).owner = None;
    }

    /// Kernel virtual address of the frame's page.
    pub fn kva(&self, id: FrameId) -> usize {
        self.slab.lock().frame(id).kva
    }

    /// Drops the frame and returns its page to the user pool.
    pub fn release(&self, id: FrameId) {
        let kva;
        {
            let mut slab = self.slab.lock();
            kva = slab.slots[id].take().expect("stale frame id").kva;
            slab.queue.retain(|&queued| queued != id);
            slab.free_ids.push(id);
        }
        self.pool.free_page(kva);
    }

    /// Frames currently allocated from the pool.
    pub fn live_frames(&self) -> usize {
        let slab = self.slab.lock();
        slab.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn pool(&self) -> &UserPool {
        &self.pool
    }
}
