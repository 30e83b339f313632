//! File-backed pages and the mmap/munmap entry points. The backing store is
//! the mapped file itself: a fault reads the page's file region, eviction
//! and unmap write dirty pages back.

use super::frame::{FrameId, FrameTable};
use super::swap::SwapTable;
use super::{FileAux, FilePage, Page, SupplementalPageTable, VmType};
use crate::fs::File;
use crate::mem::pagedir::PageDirectory;
use crate::threading::Thread;
use hashbrown::HashMap;
use marrowos_shared::mem::{is_page_aligned, page_round_up, OFFSET, PAGE_FRAME_SIZE};

impl FilePage {
    fn aux(&self) -> &FileAux {
        self.init
            .aux
            .as_ref()
            .expect("file-backed page without file metadata")
    }

    /// Loads the page's file region into the frame at `kva` and zero-fills
    /// the tail. A short read fails the fault. The dirty bit is preserved
    /// across the load.
    pub(super) fn swap_in(&mut self, pagedir: &mut PageDirectory, va: usize, kva: usize) -> bool {
        let aux = self.aux();
        let dirty = pagedir.is_dirty(va);
        // SAFETY: kva addresses the whole frame just linked to this page.
        let page = unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_FRAME_SIZE) };
        if aux.file.read_at(&mut page[..aux.read_bytes], aux.offset) != aux.read_bytes {
            return false;
        }
        page[aux.read_bytes..].fill(0);
        pagedir.set_dirty(va, dirty);
        true
    }

    /// Writes the page back to its file region if it is dirty; a clean page
    /// needs no I/O.
    pub(super) fn swap_out(&mut self, pagedir: &mut PageDirectory, va: usize, kva: usize) -> bool {
        if !pagedir.is_dirty(va) {
            return true;
        }
        let aux = self.aux();
        // SAFETY: kva addresses the whole frame still linked to this page.
        let page = unsafe { core::slice::from_raw_parts(kva as *const u8, PAGE_FRAME_SIZE) };
        aux.file.write_at(&page[..aux.read_bytes], aux.offset);
        pagedir.set_dirty(va, false);
        true
    }

    /// Releases the frame (if resident) and the per-page file handle. This
    /// is the page's one close site.
    pub(super) fn destroy(self, frames: &FrameTable, frame: Option<FrameId>) {
        if let Some(id) = frame {
            frames.release(id);
        }
        if let Some(aux) = self.init.aux {
            aux.file.close();
        }
    }
}

/// Writes back, unmaps, and destroys every page of the mmap region whose
/// head is at `head`. Write-back strictly precedes the mapping clear.
pub(super) fn munmap_region(
    pages: &mut HashMap<usize, Page>,
    frames: &FrameTable,
    swap: &SwapTable,
    pagedir: &mut PageDirectory,
    head: usize,
) {
    let page_count = pages.get(&head).map_or(0, |page| page.page_count);
    for index in 0..page_count {
        let va = head + index * PAGE_FRAME_SIZE;
        let Some(page) = pages.get(&va) else {
            continue;
        };
        if page.frame.is_some() && pagedir.is_dirty(va) {
            if let (Some(aux), Some(kva)) = (page.file_aux(), pagedir.get_page(va)) {
                // SAFETY: the mapping is still installed, so kva addresses
                // the page's whole frame.
                let data =
                    unsafe { core::slice::from_raw_parts(kva as *const u8, PAGE_FRAME_SIZE) };
                aux.file.write_at(&data[..aux.read_bytes], aux.offset);
            }
            pagedir.set_dirty(va, false);
        }
        pagedir.clear_page(va);
        let page = pages.remove(&va).expect("mmap page vanished");
        page.destroy(frames, swap);
    }
}

impl Thread {
    /// Maps `length` bytes of `file` starting at `offset` into the address
    /// space at `addr`. Returns the mapped address, or `None` if the
    /// arguments are invalid or the span overlaps an existing page. Each
    /// page holds its own duplicate of `file`, so the mapping survives the
    /// caller closing its handle.
    pub fn mmap(
        &mut self,
        addr: usize,
        length: usize,
        writable: bool,
        file: &File,
        offset: usize,
    ) -> Option<usize> {
        if !is_page_aligned(addr) || length == 0 {
            return None;
        }
        let file_len = file.length();
        if file_len == 0 || offset >= file_len {
            return None;
        }
        let read_bytes = length.min(file_len - offset);
        let span = page_round_up(read_bytes);
        if addr.checked_add(span)? > OFFSET {
            return None;
        }
        let page_count = span / PAGE_FRAME_SIZE;

        for index in 0..page_count {
            if self.spt.find(addr + index * PAGE_FRAME_SIZE).is_some() {
                return None;
            }
        }

        let mut remaining = read_bytes;
        for index in 0..page_count {
            let va = addr + index * PAGE_FRAME_SIZE;
            let page_read_bytes = remaining.min(PAGE_FRAME_SIZE);
            let aux = FileAux {
                file: file.duplicate(),
                offset: offset + index * PAGE_FRAME_SIZE,
                read_bytes: page_read_bytes,
                zero_bytes: PAGE_FRAME_SIZE - page_read_bytes,
            };
            let allocated = self.alloc_page_with_initializer(VmType::FILE, va, writable, Some(aux));
            assert!(allocated, "mmap: page allocation failed at {va:#x}");
            remaining -= page_read_bytes;
        }

        self.spt
            .find_mut(addr)
            .expect("mmap head page missing")
            .page_count = page_count;
        self.spt.mmap_regions.push(addr);
        Some(addr)
    }

    /// Unmaps the region previously returned by `mmap` at `addr`: dirty
    /// pages are written back, mappings cleared, and every page destroyed.
    /// Any other address is ignored.
    pub fn munmap(&mut self, addr: usize) {
        let Some(position) = self
            .spt
            .mmap_regions
            .iter()
            .position(|&head| head == addr)
        else {
            return;
        };
        self.spt.mmap_regions.remove(position);
        let Thread { pagedir, spt, .. } = self;
        let SupplementalPageTable {
            pages,
            frames,
            swap,
            ..
        } = spt;
        munmap_region(pages, frames, swap, pagedir, addr);
    }
}

#[cfg(test)]
mod test {
    use crate::threading::Thread;
    use crate::vm::test::{fs_with_file, vm_fixture};
    use crate::vm::VmType;
    use marrowos_shared::mem::{OFFSET, PAGE_FRAME_SIZE};

    const MAP: usize = 0x1000_0000;
    const HEAP: usize = 0x2000_0000;

    #[test]
    fn mapped_file_reads_contents_then_zeros() {
        let vm = vm_fixture(8, 8);
        let (_fs, file) = fs_with_file("/f", &[0xab; 5000]);
        let mut thread = Thread::new(1, &vm);

        assert_eq!(thread.mmap(MAP, 5000, true, &file, 0), Some(MAP));
        // Two pages cover 5000 bytes; nothing is resident yet.
        assert_eq!(thread.spt.find(MAP).unwrap().page_count(), 2);
        assert!(!thread.spt.find(MAP).unwrap().is_resident());

        let mut buf = vec![0u8; 2 * PAGE_FRAME_SIZE];
        assert!(thread.read_user(MAP, &mut buf));
        assert!(buf[..5000].iter().all(|&byte| byte == 0xab));
        assert!(buf[5000..].iter().all(|&byte| byte == 0));
        file.close();
    }

    #[test]
    fn munmap_writes_dirty_pages_back() {
        let vm = vm_fixture(8, 8);
        let (fs, file) = fs_with_file("/f", &[0xab; 5000]);
        let mut thread = Thread::new(1, &vm);

        assert_eq!(thread.mmap(MAP, 5000, true, &file, 0), Some(MAP));
        assert!(thread.fill_user(MAP, 0xcc, PAGE_FRAME_SIZE));
        thread.munmap(MAP);

        let reopened = fs.open("/f").unwrap();
        let mut contents = vec![0u8; 5000];
        assert_eq!(reopened.read_at(&mut contents, 0), 5000);
        assert!(contents[..PAGE_FRAME_SIZE].iter().all(|&byte| byte == 0xcc));
        assert!(contents[PAGE_FRAME_SIZE..].iter().all(|&byte| byte == 0xab));
        // Only the dirty page was written.
        assert_eq!(fs.write_count(), 1);
        reopened.close();
        file.close();

        // The region is gone from the address space.
        assert!(thread.spt.find(MAP).is_none());
        assert_eq!(thread.read_user_byte(MAP), None);
    }

    #[test]
    fn clean_pages_evict_without_writeback() {
        let vm = vm_fixture(2, 8);
        let (fs, file) = fs_with_file("/f", &[0xab; 5000]);
        let mut thread = Thread::new(1, &vm);

        assert_eq!(thread.mmap(MAP, 5000, true, &file, 0), Some(MAP));
        assert_eq!(thread.read_user_byte(MAP), Some(0xab));
        assert_eq!(thread.read_user_byte(MAP + PAGE_FRAME_SIZE), Some(0xab));

        // Heap traffic evicts both clean mapped pages.
        for index in 0..2 {
            let va = HEAP + index * PAGE_FRAME_SIZE;
            assert!(thread.alloc_page(VmType::ANON, va, true));
            assert!(thread.write_user_byte(va, 1));
        }
        assert!(!thread.spt.find(MAP).unwrap().is_resident());
        assert_eq!(fs.write_count(), 0);

        // Re-faulting still yields the file's bytes.
        assert_eq!(thread.read_user_byte(MAP + 100), Some(0xab));
        file.close();
    }

    #[test]
    fn dirty_pages_evict_with_writeback() {
        let vm = vm_fixture(2, 8);
        let (fs, file) = fs_with_file("/f", &[0xab; 5000]);
        let mut thread = Thread::new(1, &vm);

        assert_eq!(thread.mmap(MAP, 5000, true, &file, 0), Some(MAP));
        assert!(thread.fill_user(MAP, 0xdd, PAGE_FRAME_SIZE));

        for index in 0..2 {
            let va = HEAP + index * PAGE_FRAME_SIZE;
            assert!(thread.alloc_page(VmType::ANON, va, true));
            assert!(thread.write_user_byte(va, 1));
        }
        assert!(!thread.spt.find(MAP).unwrap().is_resident());
        assert_eq!(fs.write_count(), 1);

        let mut contents = vec![0u8; PAGE_FRAME_SIZE];
        assert_eq!(file.read_at(&mut contents, 0), PAGE_FRAME_SIZE);
        assert!(contents.iter().all(|&byte| byte == 0xdd));

        // The write-back cleaned the page: nothing new on re-fault + evict.
        assert_eq!(thread.read_user_byte(MAP), Some(0xdd));
        file.close();
    }

    #[test]
    fn overlapping_mmap_rejected() {
        let vm = vm_fixture(8, 8);
        let (_fs, file) = fs_with_file("/f", &[0xab; 5000]);
        let mut thread = Thread::new(1, &vm);

        assert_eq!(thread.mmap(MAP, 2 * PAGE_FRAME_SIZE, true, &file, 0), Some(MAP));
        let overlap = MAP + PAGE_FRAME_SIZE;
        assert_eq!(thread.mmap(overlap, PAGE_FRAME_SIZE, true, &file, 0), None);

        // The first mapping is untouched.
        let page = thread.spt.find(overlap).unwrap();
        assert_eq!(page.page_count(), 0);
        assert_eq!(thread.spt.find(MAP).unwrap().page_count(), 2);
        assert_eq!(thread.read_user_byte(overlap), Some(0xab));
        file.close();
    }

    #[test]
    fn mmap_argument_validation() {
        let vm = vm_fixture(8, 8);
        let (_fs, file) = fs_with_file("/f", &[0xab; 100]);
        let mut thread = Thread::new(1, &vm);

        assert_eq!(thread.mmap(MAP + 1, 100, true, &file, 0), None);
        assert_eq!(thread.mmap(MAP, 0, true, &file, 0), None);
        assert_eq!(thread.mmap(MAP, 100, true, &file, 100), None);
        assert_eq!(thread.mmap(OFFSET, 100, true, &file, 0), None);
        assert!(thread.spt.is_empty());

        let empty = _fs.create("/empty").unwrap();
        assert_eq!(thread.mmap(MAP, 100, true, &empty, 0), None);
        empty.close();
        file.close();
    }

    #[test]
    fn munmap_ignores_non_head_addresses() {
        let vm = vm_fixture(8, 8);
        let (_fs, file) = fs_with_file("/f", &[0xab; 5000]);
        let mut thread = Thread::new(1, &vm);

        assert_eq!(thread.mmap(MAP, 5000, true, &file, 0), Some(MAP));
        thread.munmap(MAP + PAGE_FRAME_SIZE);
        assert!(thread.spt.find(MAP).is_some());
        assert!(thread.spt.find(MAP + PAGE_FRAME_SIZE).is_some());
        file.close();
    }

    #[test]
    fn mapping_survives_caller_close() {
        let vm = vm_fixture(8, 8);
        let (_fs, file) = fs_with_file("/f", &[0x3e; 4096]);
        let mut thread = Thread::new(1, &vm);

        assert_eq!(thread.mmap(MAP, 4096, true, &file, 0), Some(MAP));
        file.close();
        assert_eq!(thread.read_user_byte(MAP + 17), Some(0x3e));
        thread.munmap(MAP);
    }

    #[test]
    fn exit_writes_back_and_releases_everything() {
        let vm = vm_fixture(4, 8);
        let (fs, file) = fs_with_file("/f", &[0xab; 5000]);
        let mut thread = Thread::new(1, &vm);

        assert_eq!(thread.mmap(MAP, 5000, true, &file, 0), Some(MAP));
        assert!(thread.fill_user(MAP, 0xcc, 16));
        file.close();
        thread.exit_vm();

        let reopened = fs.open("/f").unwrap();
        let mut head = [0u8; 16];
        assert_eq!(reopened.read_at(&mut head, 0), 16);
        assert!(head.iter().all(|&byte| byte == 0xcc));
        reopened.close();
        assert_eq!(vm.frames().pool().free_frames(), 4);

        // Every per-page duplicate was closed: the unlinked file's data
        // disappears with the last handle.
        fs.unlink("/f").unwrap();
        assert!(fs.open("/f").is_err());
    }

    #[test]
    fn short_read_fails_the_fault() {
        let vm = vm_fixture(4, 4);
        let (_fs, file) = fs_with_file("/f", &[0x77; 4096]);
        let mut thread = Thread::new(1, &vm);

        assert_eq!(thread.mmap(MAP, 4096, true, &file, 0), Some(MAP));
        file.truncate(100);
        assert_eq!(thread.read_user_byte(MAP), None);
        assert_eq!(thread.exit_code, Some(-1));
        file.close();
    }

    #[test]
    fn fork_shares_file_contents_not_frames() {
        let vm = vm_fixture(8, 8);
        let mut pattern = vec![0u8; 2 * PAGE_FRAME_SIZE];
        for (index, byte) in pattern.iter_mut().enumerate() {
            *byte = (index % 251) as u8;
        }
        let (fs, file) = fs_with_file("/m", &pattern);
        let mut parent = Thread::new(1, &vm);

        assert_eq!(
            parent.mmap(MAP, 2 * PAGE_FRAME_SIZE, true, &file, 0),
            Some(MAP)
        );
        assert!(parent.write_user_byte(MAP, 0x77));

        let mut child = Thread::new(2, &vm);
        assert!(child.copy_address_space(&parent.spt));
        assert_eq!(child.spt.find(MAP).unwrap().page_count(), 2);

        // Resident page copied by value, untouched page loaded lazily.
        assert_eq!(child.read_user_byte(MAP), Some(0x77));
        assert_eq!(
            child.read_user_byte(MAP + PAGE_FRAME_SIZE + 5),
            Some(pattern[PAGE_FRAME_SIZE + 5])
        );

        // The child's copy is clean; only the parent writes back.
        child.munmap(MAP);
        assert_eq!(fs.write_count(), 0);
        parent.munmap(MAP);
        assert_eq!(fs.write_count(), 1);

        let mut first = [0u8; 1];
        assert_eq!(file.read_at(&mut first, 0), 1);
        assert_eq!(first[0], 0x77);
        file.close();
    }
}
