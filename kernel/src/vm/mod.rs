//! The supplemental virtual memory subsystem. Every virtual page a process
//! has reserved is tracked in its supplemental page table, whether or not a
//! frame currently backs it: pages start uninitialized, materialize on
//! first fault, and may later migrate to the swap disk (anonymous pages) or
//! back to their file (mapped pages) when a frame is reclaimed.

pub mod anon;
pub mod file;
pub mod frame;
pub mod swap;

use crate::block::block_core::{Block, BlockSector};
use crate::mem::pagedir::PageDirectory;
use crate::mem::palloc::UserPool;
use crate::threading::{InterruptFrame, Pid, Thread};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use frame::{FrameId, FrameTable};
use hashbrown::HashMap;
use marrowos_shared::mem::{
    page_round_down, OFFSET, PAGE_FRAME_SIZE, STACK_FLOOR, USER_STACK_TOP,
};
use marrowos_shared::println;
use swap::SwapTable;

bitflags! {
    /// Page classes. `ANON` and `FILE` select the materialized variant;
    /// `STACK` marks stack pages, which are claimed eagerly and duplicated
    /// by value on fork.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmType: u32 {
        const ANON = 1 << 0;
        const FILE = 1 << 1;
        const STACK = 1 << 3;
    }
}

impl VmType {
    fn base(self) -> VmType {
        self & (VmType::ANON | VmType::FILE)
    }

    pub fn is_stack(self) -> bool {
        self.contains(VmType::STACK)
    }
}

/// File region metadata a mapped page carries: which bytes of which file
/// the page mirrors, and how much zero fill follows them. The handle is
/// owned by the page and closed exactly once, when the page is destroyed.
pub struct FileAux {
    pub file: crate::fs::File,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

/// The payload a page is created with and keeps for its whole life: the
/// variant it materializes into and, for file pages, the file region.
/// Fork re-creates child pages from it.
pub struct PageInit {
    pub ty: VmType,
    pub aux: Option<FileAux>,
}

impl PageInit {
    fn empty() -> Self {
        Self {
            ty: VmType::empty(),
            aux: None,
        }
    }
}

/// A page that has been reserved but never touched.
pub struct UninitPage {
    init: PageInit,
}

/// A page backed by swap once evicted. `slot` holds its data iff the page
/// is not resident and has been evicted at least once.
pub struct AnonPage {
    slot: Option<BlockSector>,
    init: PageInit,
}

/// A page backed by a region of a file.
pub struct FilePage {
    init: PageInit,
}

pub enum PageKind {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// One tracked virtual page. The kind tag transitions Uninit → Anon or
/// Uninit → File exactly once, at first touch.
pub struct Page {
    va: usize,
    writable: bool,
    frame: Option<FrameId>,
    /// Number of pages in the mmap region this page heads; zero elsewhere.
    page_count: usize,
    kind: PageKind,
}

impl Page {
    fn new_uninit(va: usize, writable: bool, init: PageInit) -> Self {
        Self {
            va,
            writable,
            frame: None,
            page_count: 0,
            kind: PageKind::Uninit(UninitPage { init }),
        }
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Pages in the mmap region this page heads; zero for any other page.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    fn init(&self) -> &PageInit {
        match &self.kind {
            PageKind::Uninit(uninit) => &uninit.init,
            PageKind::Anon(anon) => &anon.init,
            PageKind::File(file) => &file.init,
        }
    }

    /// The type the page was allocated with, marker bits included.
    fn origin_type(&self) -> VmType {
        self.init().ty
    }

    fn file_aux(&self) -> Option<&FileAux> {
        self.init().aux.as_ref()
    }

    /// Duplicates the init payload for a forked child, giving the child its
    /// own file handle. Anonymous pages carry no handle.
    fn clone_init_aux(&self) -> Option<FileAux> {
        self.init().aux.as_ref().map(|aux| FileAux {
            file: aux.file.duplicate(),
            offset: aux.offset,
            read_bytes: aux.read_bytes,
            zero_bytes: aux.zero_bytes,
        })
    }

    fn swap_slot(&self) -> Option<BlockSector> {
        match &self.kind {
            PageKind::Anon(anon) => anon.slot,
            _ => None,
        }
    }

    /// One-shot upgrade from Uninit to the target variant. The init payload
    /// moves into the new variant; fork reads it from there.
    fn materialize(&mut self) {
        let PageKind::Uninit(uninit) = &mut self.kind else {
            return;
        };
        let init = core::mem::replace(&mut uninit.init, PageInit::empty());
        let base = init.ty.base();
        if base == VmType::ANON {
            self.kind = PageKind::Anon(AnonPage { slot: None, init });
        } else if base == VmType::FILE {
            self.kind = PageKind::File(FilePage { init });
        } else {
            panic!("uninit page with no target type");
        }
    }

    /// Fork: turn an uninitialized child page into a swapped-out anonymous
    /// page holding the copied slot.
    fn adopt_swap_slot(&mut self, sec_no: BlockSector) {
        self.materialize();
        match &mut self.kind {
            PageKind::Anon(anon) => anon.slot = Some(sec_no),
            _ => panic!("swap slot adopted by a non-anonymous page"),
        }
    }

    /// Fills the frame at `kva` with the page's contents. First touch
    /// upgrades the page to its target variant.
    fn swap_in(&mut self, swap: &SwapTable, pagedir: &mut PageDirectory, kva: usize) -> bool {
        self.materialize();
        let va = self.va;
        match &mut self.kind {
            PageKind::Uninit(_) => unreachable!("uninit page survived materialization"),
            PageKind::Anon(anon) => anon.swap_in(swap, kva),
            PageKind::File(file) => file.swap_in(pagedir, va, kva),
        }
    }

    /// Saves the page's contents out of the frame at `kva` ahead of
    /// eviction.
    fn swap_out(&mut self, swap: &SwapTable, pagedir: &mut PageDirectory, kva: usize) -> bool {
        let va = self.va;
        match &mut self.kind {
            PageKind::Uninit(_) => true,
            PageKind::Anon(anon) => anon.swap_out(swap, kva),
            PageKind::File(file) => file.swap_out(pagedir, va, kva),
        }
    }

    /// Releases everything the page owns: its frame or swap slot, and for
    /// file pages the per-page file handle.
    fn destroy(self, frames: &FrameTable, swap: &SwapTable) {
        let frame = self.frame;
        match self.kind {
            PageKind::Uninit(uninit) => {
                if let Some(aux) = uninit.init.aux {
                    aux.file.close();
                }
            }
            PageKind::Anon(anon) => anon.destroy(frames, swap, frame),
            PageKind::File(file) => file.destroy(frames, frame),
        }
    }
}

/// The shared state `vm_init` produces once at boot: the user frame pool,
/// the frame table over it, and the swap slot pool over the swap disk.
/// Every supplemental page table attaches to these views.
pub struct Vm {
    frames: Arc<FrameTable>,
    swap: Arc<SwapTable>,
}

impl Vm {
    pub fn new(user_frames: usize, swap_disk: Block) -> Self {
        let pool = Arc::new(UserPool::new(user_frames));
        let swap = Arc::new(SwapTable::new(swap_disk));
        println!(
            "vm: {} user frames, {} swap slots",
            user_frames,
            swap.capacity()
        );
        Self {
            frames: Arc::new(FrameTable::new(pool)),
            swap,
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }
}

/// Per-process index of every reserved virtual page, plus the process's
/// view of the shared frame and swap state. Only the owning thread mutates
/// the index; the views carry their own locks.
pub struct SupplementalPageTable {
    pages: HashMap<usize, Page>,
    /// Head pages of mmap regions, in mapping order.
    mmap_regions: Vec<usize>,
    frames: Arc<FrameTable>,
    swap: Arc<SwapTable>,
}

impl SupplementalPageTable {
    pub fn new(vm: &Vm) -> Self {
        Self {
            pages: HashMap::new(),
            mmap_regions: Vec::new(),
            frames: vm.frames.clone(),
            swap: vm.swap.clone(),
        }
    }

    pub fn find(&self, va: usize) -> Option<&Page> {
        self.pages.get(&va)
    }

    pub fn find_mut(&mut self, va: usize) -> Option<&mut Page> {
        self.pages.get_mut(&va)
    }

    /// Inserts `page`, failing if its address is already reserved.
    #[must_use]
    pub fn insert(&mut self, page: Page) -> bool {
        match self.pages.entry(page.va) {
            hashbrown::hash_map::Entry::Occupied(_) => false,
            hashbrown::hash_map::Entry::Vacant(entry) => {
                entry.insert(page);
                true
            }
        }
    }

    /// Removes and destroys the page at `va`.
    pub fn remove(&mut self, va: usize) -> bool {
        let Some(page) = self.pages.remove(&va) else {
            return false;
        };
        page.destroy(&self.frames, &self.swap);
        true
    }

    /// Tears the table down: unmaps every mmap region front to back (which
    /// writes dirty pages back), then destroys all remaining pages.
    pub fn kill(&mut self, pagedir: &mut PageDirectory) {
        while !self.mmap_regions.is_empty() {
            let head = self.mmap_regions.remove(0);
            let Self {
                pages,
                frames,
                swap,
                ..
            } = self;
            file::munmap_region(pages, frames, swap, pagedir, head);
        }
        let Self {
            pages,
            frames,
            swap,
            ..
        } = self;
        for (va, page) in pages.drain() {
            pagedir.clear_page(va);
            page.destroy(frames, swap);
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Hands back a usable frame, never empty-handed: the pool first, then the
/// oldest frame owned by `pid`, evicted. The frame lock is dropped before
/// the victim's contents move; a concurrent re-fault on the victim
/// serializes on the allocator because the frame only becomes reusable
/// after its links are broken here.
fn vm_get_frame(
    pages: &mut HashMap<usize, Page>,
    frames: &FrameTable,
    swap: &SwapTable,
    pagedir: &mut PageDirectory,
    pid: Pid,
) -> FrameId {
    if let Some(id) = frames.try_acquire() {
        return id;
    }

    let (id, owner) = frames.pop_victim(pid).expect("memory and swap full");
    let kva = frames.kva(id);
    let victim = pages
        .get_mut(&owner.va)
        .expect("victim frame not in the page table");
    let saved = victim.swap_out(swap, pagedir, kva);
    assert!(saved, "eviction write-out failed");
    pagedir.clear_page(owner.va);
    victim.frame = None;
    frames.clear_owner(id);
    // SAFETY: kva addresses the whole reclaimed frame.
    unsafe { core::ptr::write_bytes(kva as *mut u8, 0, PAGE_FRAME_SIZE) };
    id
}

impl Thread {
    /// Reserves the page at `va` without materializing it. `ty` selects the
    /// variant the first fault will produce; `aux` carries the file region
    /// for mapped pages. Stack pages are claimed immediately. Returns false
    /// if `va` is already reserved.
    pub fn alloc_page_with_initializer(
        &mut self,
        ty: VmType,
        va: usize,
        writable: bool,
        aux: Option<FileAux>,
    ) -> bool {
        debug_assert!(
            !ty.base().is_empty() && ty.base() != (VmType::ANON | VmType::FILE),
            "page type must be anon or file"
        );
        debug_assert_eq!(va, page_round_down(va));
        if self.spt.find(va).is_some() {
            if let Some(aux) = aux {
                aux.file.close();
            }
            return false;
        }
        let inserted = self
            .spt
            .insert(Page::new_uninit(va, writable, PageInit { ty, aux }));
        debug_assert!(inserted);
        if ty.is_stack() {
            return self.do_claim_page(va);
        }
        true
    }

    /// Reserves a bare page with no init payload.
    pub fn alloc_page(&mut self, ty: VmType, va: usize, writable: bool) -> bool {
        self.alloc_page_with_initializer(ty, va, writable, None)
    }

    /// Claims the page containing `va`: binds it to a frame and installs
    /// the mapping.
    pub fn claim_page(&mut self, va: usize) -> bool {
        self.do_claim_page(page_round_down(va))
    }

    pub(crate) fn do_claim_page(&mut self, va: usize) -> bool {
        let pid = self.pid;
        let Thread { pagedir, spt, .. } = self;
        let SupplementalPageTable {
            pages,
            frames,
            swap,
            ..
        } = spt;

        match pages.get(&va) {
            None => return false,
            Some(page) if page.frame.is_some() => return true,
            Some(_) => {}
        }

        let id = vm_get_frame(pages, frames, swap, pagedir, pid);
        let kva = frames.kva(id);
        let page = pages.get_mut(&va).expect("page vanished during claim");
        page.frame = Some(id);
        frames.set_owner(id, pid, va);
        pagedir.set_page(va, kva, page.writable);
        page.swap_in(swap, pagedir, kva)
    }

    /// Page fault entry. Returns true when the fault has been satisfied;
    /// false means a real fault and the caller kills the process.
    pub fn try_handle_fault(
        &mut self,
        frame: &InterruptFrame,
        addr: usize,
        user: bool,
        write: bool,
        not_present: bool,
    ) -> bool {
        if user && addr >= OFFSET {
            return false;
        }

        // A push faults on rsp - 8 before rsp moves; anything else between
        // rsp and the stack top is a live stack access.
        let rsp = frame.rsp;
        let stack_access = rsp.wrapping_sub(8) == addr
            || ((STACK_FLOOR..USER_STACK_TOP).contains(&addr) && rsp <= addr);
        if stack_access && self.stack_growth(addr) {
            return true;
        }

        if !not_present {
            // Write to a present, read-only mapping.
            return false;
        }

        let va = page_round_down(addr);
        let Some(page) = self.spt.find(va) else {
            return false;
        };
        if write && !page.writable {
            return false;
        }
        self.do_claim_page(va)
    }

    /// Extends the stack to cover `addr`. An already-reserved page (a stack
    /// page that was evicted) is claimed back in; otherwise fresh anonymous
    /// pages are allocated from `addr`'s page up to the existing stack.
    fn stack_growth(&mut self, addr: usize) -> bool {
        let mut va = page_round_down(addr);
        if !(STACK_FLOOR..USER_STACK_TOP).contains(&va) {
            return false;
        }
        if self.spt.find(va).is_some() {
            return self.do_claim_page(va);
        }
        while va < USER_STACK_TOP && self.spt.find(va).is_none() {
            if !self.alloc_page(VmType::ANON | VmType::STACK, va, true) {
                return false;
            }
            va += PAGE_FRAME_SIZE;
        }
        true
    }

    /// Duplicates `parent`'s address space into this (fresh) thread. Runs
    /// in the child's context. Stack pages are copied by value immediately;
    /// other pages are re-created lazily from their init payload, with
    /// resident contents copied and swapped contents cloned slot-for-slot.
    /// On failure the caller tears the child down through its normal exit.
    #[must_use]
    pub fn copy_address_space(&mut self, parent: &SupplementalPageTable) -> bool {
        for (&va, src) in parent.pages.iter() {
            let ty = src.origin_type();

            if ty.is_stack() {
                if !self.alloc_page(ty, va, src.writable) {
                    return false;
                }
                let child_frame = self.spt.pages[&va].frame.expect("stack page not resident");
                let child_kva = self.spt.frames.kva(child_frame);
                match src.swap_slot() {
                    Some(sec_no) => {
                        // SAFETY: child_kva addresses the child's own frame.
                        unsafe { self.spt.swap.read_slot(sec_no, child_kva) };
                    }
                    None => {
                        let parent_frame =
                            src.frame.expect("stack page neither resident nor swapped");
                        let parent_kva = parent.frames.kva(parent_frame);
                        // SAFETY: both addresses cover whole, distinct frames.
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                parent_kva as *const u8,
                                child_kva as *mut u8,
                                PAGE_FRAME_SIZE,
                            )
                        };
                    }
                }
                continue;
            }

            if !self.alloc_page_with_initializer(ty, va, src.writable, src.clone_init_aux()) {
                return false;
            }
            self.spt
                .find_mut(va)
                .expect("child page missing after alloc")
                .page_count = src.page_count;

            if let Some(sec_no) = src.swap_slot() {
                let copied = self.spt.swap.copy(sec_no);
                self.spt
                    .find_mut(va)
                    .expect("child page missing after alloc")
                    .adopt_swap_slot(copied);
            } else if let Some(parent_frame) = src.frame {
                if !self.do_claim_page(va) {
                    return false;
                }
                let parent_kva = parent.frames.kva(parent_frame);
                let child_frame = self.spt.pages[&va].frame.expect("claimed page not resident");
                let child_kva = self.spt.frames.kva(child_frame);
                // SAFETY: both addresses cover whole, distinct frames.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        parent_kva as *const u8,
                        child_kva as *mut u8,
                        PAGE_FRAME_SIZE,
                    )
                };
            }
            // Still uninitialized (or an evicted clean file page): stays lazy.
        }

        self.spt.mmap_regions.extend(parent.mmap_regions.iter());
        true
    }
}
