use super::{Pid, Tid};
use crate::fs::File;
use crate::mem::pagedir::PageDirectory;
use crate::vm::{SupplementalPageTable, Vm};
use marrowos_shared::mem::USER_STACK_TOP;

/// The per-thread state the virtual memory subsystem works against: the
/// thread's page directory, its supplemental page table, and the executable
/// it is running. Scheduling state lives elsewhere.
pub struct Thread {
    pub pid: Pid,
    pub tid: Tid,
    pub pagedir: PageDirectory,
    pub spt: SupplementalPageTable,
    pub running_executable: Option<File>,
    pub exit_code: Option<i32>,
    /// Last user-mode stack pointer, as saved on kernel entry.
    pub user_rsp: usize,
}

impl Thread {
    /// Creates a thread attached to the shared VM state. The new address
    /// space is empty; the first stack page appears on first fault.
    pub fn new(pid: Pid, vm: &Vm) -> Self {
        Self {
            pid,
            tid: pid,
            pagedir: PageDirectory::new(),
            spt: SupplementalPageTable::new(vm),
            running_executable: None,
            exit_code: None,
            user_rsp: USER_STACK_TOP,
        }
    }

    /// Tears down the thread's address space on exit: writes back every
    /// mapped region, then destroys all remaining pages.
    pub fn exit_vm(&mut self) {
        let Thread { pagedir, spt, .. } = self;
        spt.kill(pagedir);
        if let Some(executable) = self.running_executable.take() {
            executable.close();
        }
    }
}
