//! The swap slot pool. A slot is a page-sized run of eight sectors on the
//! swap disk, identified by its starting sector. Slots move between a free
//! list and a used list under `swap_lock`; sector transfers happen with the
//! lock released.

use crate::block::block_core::{Block, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::sync::mutex::Mutex;
use alloc::collections::{BTreeSet, VecDeque};
use marrowos_shared::println;
use marrowos_shared::sizes::SECTORS_PER_PAGE;

struct SwapLists {
    free: VecDeque<BlockSector>,
    used: BTreeSet<BlockSector>,
}

pub struct SwapTable {
    disk: Block,
    lists: Mutex<SwapLists>,
    capacity: usize,
}

impl SwapTable {
    /// Builds the pool by carving `disk` into page-sized slots. The pool's
    /// size is fixed from the disk's capacity.
    pub fn new(disk: Block) -> Self {
        assert!(
            disk.get_type() == BlockType::Swap,
            "swap table requires a swap block device"
        );
        let slots = disk.get_size() as usize / SECTORS_PER_PAGE;
        let free: VecDeque<BlockSector> = (0..slots)
            .map(|slot| (slot * SECTORS_PER_PAGE) as BlockSector)
            .collect();
        println!("swap: {} slots on \"{}\"", slots, disk.get_name());
        Self {
            disk,
            lists: Mutex::new(SwapLists {
                free,
                used: BTreeSet::new(),
            }),
            capacity: slots,
        }
    }

    /// Takes a slot off the free list. Panics when memory and swap are both
    /// exhausted; there is no recovery from that.
    pub fn alloc(&self) -> BlockSector {
        let mut lists = self.lists.lock();
        let sec_no = lists.free.pop_front().expect("memory and swap full");
        lists.used.insert(sec_no);
        sec_no
    }

    /// Returns `sec_no` to the head of the free list.
    pub fn free(&self, sec_no: BlockSector) {
        let mut lists = self.lists.lock();
        assert!(lists.used.remove(&sec_no), "freeing a slot not in use");
        lists.free.push_front(sec_no);
    }

    /// Allocates a fresh slot holding a byte-identical copy of `sec_no`.
    /// Only fork uses this.
    pub fn copy(&self, sec_no: BlockSector) -> BlockSector {
        let dst = self.alloc();
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE as BlockSector {
            self.disk
                .read(sec_no + i, &mut buf)
                .expect("swap disk read failed");
            self.disk
                .write(dst + i, &buf)
                .expect("swap disk write failed");
        }
        dst
    }

    /// Reads the slot at `sec_no` into the page at `kva`.
    ///
    /// # Safety
    ///
    /// `kva` must address one whole writable page frame.
    pub unsafe fn read_slot(&self, sec_no: BlockSector, kva: usize) {
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            self.disk
                .read(sec_no + i as BlockSector, &mut buf)
                .expect("swap disk read failed");
            let dst = (kva + i * BLOCK_SECTOR_SIZE) as *mut u8;
            core::ptr::copy_nonoverlapping(buf.as_ptr(), dst, BLOCK_SECTOR_SIZE);
        }
    }

    /// Writes the page at `kva` into the slot at `sec_no`.
    ///
    /// # Safety
    ///
    /// `kva` must address one whole readable page frame.
    pub unsafe fn write_slot(&self, sec_no: BlockSector, kva: usize) {
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            let src = (kva + i * BLOCK_SECTOR_SIZE) as *const u8;
            core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), BLOCK_SECTOR_SIZE);
            self.disk
                .write(sec_no + i as BlockSector, &buf)
                .expect("swap disk write failed");
        }
    }

    /// Total slots the pool was seeded with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.lists.lock().free.len()
    }

    pub fn used_slots(&self) -> usize {
        self.lists.lock().used.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::ram_disk::RamDisk;
    use alloc::boxed::Box;
    use marrowos_shared::mem::PAGE_FRAME_SIZE;

    fn swap_table(slots: usize) -> SwapTable {
        let sectors = (slots * SECTORS_PER_PAGE) as BlockSector;
        let disk = Block::new(
            BlockType::Swap,
            "swap0",
            sectors,
            Box::new(RamDisk::new(sectors)),
        );
        SwapTable::new(disk)
    }

    #[test]
    fn conservation_across_alloc_free() {
        let swap = swap_table(4);
        assert_eq!(swap.capacity(), 4);
        let a = swap.alloc();
        let b = swap.alloc();
        assert_ne!(a, b);
        assert_eq!(swap.free_slots() + swap.used_slots(), swap.capacity());
        swap.free(a);
        swap.free(b);
        assert_eq!(swap.free_slots(), swap.capacity());
    }

    #[test]
    fn slot_round_trip() {
        let swap = swap_table(2);
        let page = [0x3cu8; PAGE_FRAME_SIZE];
        let sec = swap.alloc();
        unsafe { swap.write_slot(sec, page.as_ptr() as usize) };

        let mut out = [0u8; PAGE_FRAME_SIZE];
        unsafe { swap.read_slot(sec, out.as_mut_ptr() as usize) };
        assert_eq!(page, out);
    }

    #[test]
    fn copy_duplicates_contents() {
        let swap = swap_table(2);
        let mut page = [0u8; PAGE_FRAME_SIZE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let src = swap.alloc();
        unsafe { swap.write_slot(src, page.as_ptr() as usize) };

        let dst = swap.copy(src);
        assert_ne!(src, dst);
        let mut out = [0u8; PAGE_FRAME_SIZE];
        unsafe { swap.read_slot(dst, out.as_mut_ptr() as usize) };
        assert_eq!(page, out);
        assert_eq!(swap.used_slots(), 2);
    }

    #[test]
    #[should_panic(expected = "memory and swap full")]
    fn exhaustion_panics() {
        let swap = swap_table(1);
        swap.alloc();
        swap.alloc();
    }
}
