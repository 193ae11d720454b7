//! Shared-memory syscalls.

use systype::{ipc::ShmidDs, SysError, SyscallResult};

use crate::{ipc::shm, processor::current_task};

use super::{copy_in_struct, copy_out_struct};

/// `shmget()` returns the identifier of the System V shared memory segment
/// associated with `key`, creating it when asked to. The size is rounded up
/// to a multiple of the page size.
pub fn sys_shmget(key: i32, size: usize, shmflg: i32) -> SyscallResult {
    let task = current_task();
    log::info!("[sys_shmget] key {key} size {size:#x} flags {shmflg:#o}");
    shm::shmget(task.cred(), task.pid(), key, size, shmflg)
}

/// `shmat()` attaches the segment into the calling process's address space
/// and returns the chosen address. This implementation places the mapping
/// itself: a non-null `shmaddr` is refused.
pub fn sys_shmat(shmid: i32, shmaddr: usize, shmflg: i32) -> SyscallResult {
    let task = current_task();
    log::info!("[sys_shmat] id {shmid} addr {shmaddr:#x} flags {shmflg:#x}");
    shm::shmat(
        task.cred(),
        task.pid(),
        task.addr_space(),
        shmid,
        shmaddr,
        shmflg,
    )
}

/// `shmdt()` detaches the segment attached at `shmaddr`.
pub fn sys_shmdt(shmaddr: usize) -> SyscallResult {
    let task = current_task();
    log::info!("[sys_shmdt] addr {shmaddr:#x}");
    shm::shmdt(task.pid(), task.addr_space(), shmaddr)
}

/// `shmctl()`: `IPC_STAT`, `IPC_SET` and `IPC_RMID`.
pub fn sys_shmctl(shmid: i32, cmd: i32, buf: usize) -> SyscallResult {
    let task = current_task();
    let space = task.addr_space();
    log::info!("[sys_shmctl] id {shmid} cmd {cmd}");
    match cmd {
        systype::ipc::IPC_STAT => {
            let ds = shm::shm_stat(task.cred(), shmid)?;
            copy_out_struct(space, buf, &ds)?;
            Ok(0)
        }
        systype::ipc::IPC_SET => {
            let ds: ShmidDs = copy_in_struct(space, buf)?;
            shm::shm_set(
                task.cred(),
                shmid,
                ds.shm_perm.uid,
                ds.shm_perm.gid,
                ds.shm_perm.mode,
            )
        }
        systype::ipc::IPC_RMID => shm::shm_remove(task.cred(), shmid),
        _ => Err(SysError::EINVAL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::testing::{install_task, scratch};
    use config::mm::PAGE_SIZE;
    use mm::address::VirtAddr;
    use systype::ipc::{Cred, IPC_RMID, IPC_STAT};

    #[test]
    fn shm_syscalls_end_to_end() {
        let task = install_task(10, Cred { euid: 1, egid: 1 });
        let id = sys_shmget(0, PAGE_SIZE, 0o600).unwrap() as i32;
        let addr = sys_shmat(id, 0, 0).unwrap();
        task.addr_space()
            .copy_out(VirtAddr::new(addr + 9), &[0x7E])
            .unwrap();

        let buf = scratch(&task, 1);
        sys_shmctl(id, IPC_STAT, buf).unwrap();
        let ds: systype::ipc::ShmidDs = copy_in_struct(task.addr_space(), buf).unwrap();
        assert_eq!(ds.shm_segsz, PAGE_SIZE);
        assert_eq!(ds.shm_nattch, 1);
        assert_eq!(ds.shm_lpid, 10);

        sys_shmdt(addr).unwrap();
        sys_shmctl(id, IPC_RMID, 0).unwrap();
        assert_eq!(sys_shmat(id, 0, 0).unwrap_err(), SysError::EINVAL);
    }
}
