//! The numeric syscall surface.
//!
//! Each `sys_*` function parses raw flag words, moves data across the user
//! boundary with [`AddrSpace::copy_in`]/[`copy_out`], resolves the calling
//! thread through [`processor::current_task`], and delegates to the
//! subsystem. Results follow the usual convention: value on success,
//! negated errno on failure (see [`systype::error::syscall_ret`]).
//!
//! [`AddrSpace::copy_in`]: crate::vm::AddrSpace::copy_in
//! [`copy_out`]: crate::vm::AddrSpace::copy_out
//! [`processor::current_task`]: crate::processor::current_task

use ::mm::address::VirtAddr;
use systype::SysResult;

use crate::vm::AddrSpace;

mod ipc;
mod mm;

pub use ipc::{
    sys_msgctl, sys_msgget, sys_msgrcv, sys_msgsnd, sys_semctl, sys_semget, sys_semtimedop,
};
pub use mm::{sys_shmat, sys_shmctl, sys_shmdt, sys_shmget};
pub use systype::error::syscall_ret;

/// Reads a `repr(C)` structure from user memory.
fn copy_in_struct<T: Copy>(space: &AddrSpace, addr: usize) -> SysResult<T> {
    // SAFETY: T is a plain-old-data structure; every bit pattern read from
    // user memory is accepted and validated by the caller.
    unsafe {
        let mut value: T = core::mem::zeroed();
        let bytes = core::slice::from_raw_parts_mut(
            &mut value as *mut T as *mut u8,
            core::mem::size_of::<T>(),
        );
        space.copy_in(VirtAddr::new(addr), bytes)?;
        Ok(value)
    }
}

/// Writes a `repr(C)` structure to user memory.
fn copy_out_struct<T: Copy>(space: &AddrSpace, addr: usize, value: &T) -> SysResult<()> {
    // SAFETY: T is a plain-old-data structure.
    unsafe {
        let bytes = core::slice::from_raw_parts(
            value as *const T as *const u8,
            core::mem::size_of::<T>(),
        );
        space.copy_out(VirtAddr::new(addr), bytes)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Current-task plumbing for hosted tests: one task per test thread.

    use alloc::sync::Arc;
    use std::cell::RefCell;

    use systype::ipc::Cred;

    use crate::processor;
    use crate::task::Task;
    use crate::vm::AddrSpace;

    std::thread_local! {
        static CURRENT: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
    }

    fn provider() -> Option<Arc<Task>> {
        CURRENT.with(|slot| slot.borrow().clone())
    }

    /// Installs a fresh task (own address space) as this thread's current
    /// task and returns it.
    pub fn install_task(pid: usize, cred: Cred) -> Arc<Task> {
        processor::register_task_provider(provider);
        let task = Task::new(pid, cred, AddrSpace::build_user());
        CURRENT.with(|slot| *slot.borrow_mut() = Some(Arc::clone(&task)));
        task
    }

    /// A scratch user buffer inside the task's address space.
    pub fn scratch(task: &Task, pages: usize) -> usize {
        use systype::memory_flags::{MapFlags, MemProt};
        task.addr_space()
            .alloc(
                None,
                0,
                pages * config::mm::PAGE_SIZE,
                MemProt::RW,
                MapFlags::PRIVATE,
                None,
            )
            .unwrap()
            .to_usize()
    }
}
