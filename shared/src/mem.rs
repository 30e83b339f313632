use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x8000_0000;

/// Highest address of the user stack, exclusive. The stack grows downward
/// from here.
pub const USER_STACK_TOP: usize = 0x4748_0000;

/// Lowest address the user stack is permitted to grow to. One megabyte of
/// stack per process.
pub const STACK_FLOOR: usize = USER_STACK_TOP - MB;

/// Rounds `addr` down to the start of its page.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary.
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_FRAME_SIZE - 1) & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_FRAME_SIZE == 0
}
