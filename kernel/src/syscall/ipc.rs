//! Semaphore and message queue syscalls.

use alloc::{vec, vec::Vec};

use ::mm::address::VirtAddr;
use config::ipc::SEMOPM;
use systype::{
    ipc::{MsgFlags, MsgidDs, Sembuf, SemidDs, Timespec},
    SysError, SyscallResult,
};

use crate::{ipc::msg, ipc::sem, processor::current_task};

use super::{copy_in_struct, copy_out_struct};

/// `semget()` returns the identifier of the semaphore set associated with
/// `key`, creating one with `nsems` zeroed semaphores when asked to.
pub fn sys_semget(key: i32, nsems: usize, semflg: i32) -> SyscallResult {
    let task = current_task();
    log::info!("[sys_semget] key {key} nsems {nsems} flags {semflg:#o}");
    sem::semget(task.cred(), key, nsems, semflg)
}

/// `semtimedop()` atomically performs the operation array at `sops`,
/// blocking until it can proceed or the timeout elapses.
pub fn sys_semtimedop(semid: i32, sops: usize, nsops: usize, timeout: usize) -> SyscallResult {
    if nsops == 0 {
        return Err(SysError::EINVAL);
    }
    if nsops > SEMOPM {
        return Err(SysError::E2BIG);
    }
    let task = current_task();
    let space = task.addr_space();
    let mut ops = Vec::with_capacity(nsops);
    for i in 0..nsops {
        let op: Sembuf = copy_in_struct(space, sops + i * core::mem::size_of::<Sembuf>())?;
        ops.push(op);
    }
    let deadline = if timeout != 0 {
        let ts: Timespec = copy_in_struct(space, timeout)?;
        Some(timer::now_ms().saturating_add(ts.as_ms()))
    } else {
        None
    };
    log::debug!("[sys_semtimedop] id {semid} nsops {nsops}");
    sem::semtimedop(task.cred(), task.pid(), semid, &ops, deadline)
}

/// `semctl()`: the status, value and removal commands of §semctl.
///
/// `arg` is the value itself for `SETVAL` and a user pointer for the
/// commands that transfer data; the `GET*` queries return their result as
/// the syscall value.
pub fn sys_semctl(semid: i32, semnum: i32, cmd: i32, arg: usize) -> SyscallResult {
    use systype::ipc::*;

    let task = current_task();
    let cred = task.cred();
    let space = task.addr_space();
    log::debug!("[sys_semctl] id {semid} semnum {semnum} cmd {cmd}");
    match cmd {
        IPC_STAT => {
            let ds = sem::sem_stat(cred, semid)?;
            copy_out_struct(space, arg, &ds)?;
            Ok(0)
        }
        IPC_SET => {
            let ds: SemidDs = copy_in_struct(space, arg)?;
            sem::sem_set(
                cred,
                semid,
                ds.sem_perm.uid,
                ds.sem_perm.gid,
                ds.sem_perm.mode,
            )
        }
        IPC_RMID => sem::sem_remove(cred, semid),
        GETALL => {
            let values = sem::sem_getall(cred, semid)?;
            let mut bytes = Vec::with_capacity(values.len() * 2);
            for value in values {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            space.copy_out(VirtAddr::new(arg), &bytes)?;
            Ok(0)
        }
        SETALL => {
            let nsems = sem::sem_nsems(semid)?;
            let mut bytes = vec![0u8; nsems * 2];
            space.copy_in(VirtAddr::new(arg), &mut bytes)?;
            let values: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            sem::sem_setall(cred, semid, &values)
        }
        GETVAL => sem::sem_getval(cred, semid, semnum),
        SETVAL => sem::sem_setval(cred, semid, semnum, arg as i32),
        GETPID => sem::sem_getpid(cred, semid, semnum),
        GETNCNT => sem::sem_getncnt(cred, semid, semnum),
        GETZCNT => sem::sem_getzcnt(cred, semid, semnum),
        _ => Err(SysError::EINVAL),
    }
}

/// `msgget()` returns the identifier of the message queue associated with
/// `key`.
pub fn sys_msgget(key: i32, msgflg: i32) -> SyscallResult {
    let task = current_task();
    log::info!("[sys_msgget] key {key} flags {msgflg:#o}");
    msg::msgget(task.cred(), key, msgflg)
}

/// `msgsnd()` appends the message at `msgp` (a type word followed by
/// `msgsz` payload bytes) to the queue, blocking on the byte budget.
pub fn sys_msgsnd(msqid: i32, msgp: usize, msgsz: usize, msgflg: i32) -> SyscallResult {
    let flags = MsgFlags::from_bits(msgflg).ok_or(SysError::EINVAL)?;
    let task = current_task();
    let space = task.addr_space();
    let mtype: i64 = copy_in_struct(space, msgp)?;
    let mut data = vec![0u8; msgsz];
    space.copy_in(VirtAddr::new(msgp + core::mem::size_of::<i64>()), &mut data)?;
    log::debug!("[sys_msgsnd] id {msqid} size {msgsz}");
    msg::msgsnd(task.cred(), task.pid(), msqid, mtype, data, flags, None)?;
    task.count_msgsnd();
    Ok(0)
}

/// `msgrcv()` removes the message selected by `msgtyp` from the queue and
/// stores it at `msgp`, returning the number of payload bytes.
pub fn sys_msgrcv(
    msqid: i32,
    msgp: usize,
    msgsz: usize,
    msgtyp: i64,
    msgflg: i32,
) -> SyscallResult {
    let flags = MsgFlags::from_bits(msgflg).ok_or(SysError::EINVAL)?;
    let task = current_task();
    let space = task.addr_space();
    log::debug!("[sys_msgrcv] id {msqid} bufsize {msgsz} type {msgtyp}");
    let (mtype, data) = msg::msgrcv(
        task.cred(),
        task.pid(),
        msqid,
        msgsz,
        msgtyp,
        flags,
        None,
    )?;
    copy_out_struct(space, msgp, &mtype)?;
    space.copy_out(
        VirtAddr::new(msgp + core::mem::size_of::<i64>()),
        &data,
    )?;
    task.count_msgrcv();
    Ok(data.len())
}

/// `msgctl()`: `IPC_STAT`, `IPC_SET` and `IPC_RMID`.
pub fn sys_msgctl(msqid: i32, cmd: i32, buf: usize) -> SyscallResult {
    use systype::ipc::{IPC_RMID, IPC_SET, IPC_STAT};

    let task = current_task();
    let cred = task.cred();
    let space = task.addr_space();
    log::info!("[sys_msgctl] id {msqid} cmd {cmd}");
    match cmd {
        IPC_STAT => {
            let ds = msg::msg_stat(cred, msqid)?;
            copy_out_struct(space, buf, &ds)?;
            Ok(0)
        }
        IPC_SET => {
            let ds: MsgidDs = copy_in_struct(space, buf)?;
            msg::msg_set(
                cred,
                msqid,
                ds.msg_perm.uid,
                ds.msg_perm.gid,
                ds.msg_perm.mode,
                ds.msg_qbytes,
            )
        }
        IPC_RMID => msg::msg_remove(cred, msqid),
        _ => Err(SysError::EINVAL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::testing::{install_task, scratch};
    use systype::ipc::{Cred, GETVAL, IPC_STAT, SETVAL};

    #[test]
    fn sem_syscalls_move_data_through_user_memory() {
        let task = install_task(21, Cred { euid: 5, egid: 5 });
        let space = task.addr_space();
        let id = sys_semget(0, 2, 0o600).unwrap() as i32;
        sys_semctl(id, 0, SETVAL, 3).unwrap();
        assert_eq!(sys_semctl(id, 0, GETVAL, 0).unwrap(), 3);

        // A two-op transaction through user memory.
        let sops = scratch(&task, 1);
        let ops = [
            Sembuf {
                sem_num: 0,
                sem_op: -2,
                sem_flg: 0,
            },
            Sembuf {
                sem_num: 1,
                sem_op: 1,
                sem_flg: 0,
            },
        ];
        for (i, op) in ops.iter().enumerate() {
            copy_out_struct(space, sops + i * core::mem::size_of::<Sembuf>(), op).unwrap();
        }
        sys_semtimedop(id, sops, 2, 0).unwrap();
        assert_eq!(sys_semctl(id, 0, GETVAL, 0).unwrap(), 1);
        assert_eq!(sys_semctl(id, 1, GETVAL, 0).unwrap(), 1);

        let stat_buf = scratch(&task, 1);
        sys_semctl(id, 0, IPC_STAT, stat_buf).unwrap();
        let ds: SemidDs = copy_in_struct(space, stat_buf).unwrap();
        assert_eq!(ds.sem_nsems, 2);
    }

    #[test]
    fn msg_syscalls_roundtrip_and_count() {
        let task = install_task(22, Cred { euid: 6, egid: 6 });
        let space = task.addr_space();
        let id = sys_msgget(0, 0o600).unwrap() as i32;

        let buf = scratch(&task, 1);
        copy_out_struct(space, buf, &7i64).unwrap();
        space
            .copy_out(VirtAddr::new(buf + 8), b"hello")
            .unwrap();
        sys_msgsnd(id, buf, 5, 0).unwrap();

        let out = scratch(&task, 1);
        let n = sys_msgrcv(id, out, 16, 7, 0).unwrap();
        assert_eq!(n, 5);
        let mtype: i64 = copy_in_struct(space, out).unwrap();
        assert_eq!(mtype, 7);
        let mut payload = [0u8; 5];
        space.copy_in(VirtAddr::new(out + 8), &mut payload).unwrap();
        assert_eq!(&payload, b"hello");

        use core::sync::atomic::Ordering;
        assert_eq!(task.stats().msgsnd.load(Ordering::Relaxed), 1);
        assert_eq!(task.stats().msgrcv.load(Ordering::Relaxed), 1);
    }
}
