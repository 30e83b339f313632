//! Access to user memory from kernel code. Every access goes through the
//! thread's page directory; a missing or insufficient mapping raises a page
//! fault exactly as the MMU would, and a rejected fault terminates the
//! thread with exit code -1.

use crate::threading::{InterruptFrame, Thread};
use marrowos_shared::mem::{page_round_down, OFFSET, PAGE_FRAME_SIZE};

impl Thread {
    /// Resolves the user address `addr` to a kernel virtual address for an
    /// access of the given kind, faulting pages in as needed. Returns `None`
    /// after marking the thread dead when the access is invalid.
    fn resolve_user(&mut self, addr: usize, write: bool) -> Option<usize> {
        loop {
            if addr >= OFFSET {
                self.exit_code = Some(-1);
                return None;
            }
            let base = page_round_down(addr);
            let present = self.pagedir.get_page(base);
            if let Some(kva) = present {
                if !write || self.pagedir.is_writable(base) {
                    if write {
                        self.pagedir.set_dirty(base, true);
                    }
                    return Some(kva + (addr - base));
                }
            }
            let frame = InterruptFrame {
                rip: 0,
                rsp: self.user_rsp,
            };
            if !self.try_handle_fault(&frame, addr, true, write, present.is_none()) {
                self.exit_code = Some(-1);
                return None;
            }
        }
    }

    /// Copies user memory at `addr..addr + buf.len()` into `buf`. Returns
    /// false (with the thread marked dead) on an invalid access.
    #[must_use]
    pub fn read_user(&mut self, addr: usize, buf: &mut [u8]) -> bool {
        for (i, slot) in buf.iter_mut().enumerate() {
            let Some(kva) = self.resolve_user(addr + i, false) else {
                return false;
            };
            // SAFETY: kva points into a frame owned by this thread's pool.
            *slot = unsafe { *(kva as *const u8) };
        }
        true
    }

    /// Copies `buf` into user memory at `addr`. Returns false (with the
    /// thread marked dead) on an invalid access.
    #[must_use]
    pub fn write_user(&mut self, addr: usize, buf: &[u8]) -> bool {
        for (i, byte) in buf.iter().enumerate() {
            let Some(kva) = self.resolve_user(addr + i, true) else {
                return false;
            };
            // SAFETY: kva points into a frame owned by this thread's pool.
            unsafe { *(kva as *mut u8) = *byte };
        }
        true
    }

    /// Reads one byte of user memory.
    #[must_use]
    pub fn read_user_byte(&mut self, addr: usize) -> Option<u8> {
        let mut byte = [0u8];
        self.read_user(addr, &mut byte).then_some(byte[0])
    }

    /// Writes one byte of user memory.
    #[must_use]
    pub fn write_user_byte(&mut self, addr: usize, byte: u8) -> bool {
        self.write_user(addr, &[byte])
    }

    /// Fills `len` bytes of user memory at `addr` with `byte`.
    #[must_use]
    pub fn fill_user(&mut self, addr: usize, byte: u8, len: usize) -> bool {
        let mut written = 0;
        while written < len {
            let chunk_addr = addr + written;
            let page_end = page_round_down(chunk_addr) + PAGE_FRAME_SIZE;
            let chunk = (len - written).min(page_end - chunk_addr);
            let Some(kva) = self.resolve_user(chunk_addr, true) else {
                return false;
            };
            // SAFETY: the chunk stops at the page boundary kva belongs to.
            unsafe { core::ptr::write_bytes(kva as *mut u8, byte, chunk) };
            written += chunk;
        }
        true
    }
}
