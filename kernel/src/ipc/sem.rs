//! System V semaphores.
//!
//! A set is an array of counting semaphores operated on transactionally:
//! `semtimedop` applies all of its operations or none. The transaction loop
//! applies operations in order; at the first one that cannot proceed it
//! rolls back what it applied, sleeps on the set's wait queue (releasing
//! the set lock), and retries from scratch after any wakeup. Every
//! successful transaction broadcasts, because it may have unblocked
//! transactions sleeping on other semaphores of the set.

use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use config::ipc::{SEMMNI, SEMMSL, SEMOPM, SEMVMX};
use mutex::{SpinLock, WaitQueue};
use spin::Lazy;
use systype::{
    ipc::{Cred, IpcGetFlags, IpcPerm, SemFlags, Sembuf, SemidDs},
    SysError, SysResult, SyscallResult,
};
use timer::realtime_seconds;

use super::{ipc_hasperm, ipc_isowner, new_perm, sysv_get, IpcObject, IpcTable};

pub(crate) static SEM_TABLE: Lazy<IpcTable<SysvSem>> = Lazy::new(|| IpcTable::new(SEMMNI));

/// One semaphore of a set.
#[derive(Debug, Default, Clone, Copy)]
struct SemVal {
    value: u16,
    /// Threads sleeping until the value grows.
    ncnt: u16,
    /// Threads sleeping until the value reaches zero.
    zcnt: u16,
    /// Pid of the last completed operation on this semaphore.
    pid: usize,
}

/// A semaphore set.
pub struct SysvSem {
    id: i32,
    key: i32,
    removed: AtomicBool,
    inner: SpinLock<SemInner>,
    waitq: WaitQueue,
}

struct SemInner {
    perm: IpcPerm,
    otime: u64,
    ctime: u64,
    values: Vec<SemVal>,
}

impl IpcObject for SysvSem {
    fn id(&self) -> i32 {
        self.id
    }
    fn key(&self) -> i32 {
        self.key
    }
    fn removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
    fn hasperm(&self, cred: &Cred, req: u16) -> SysResult<()> {
        ipc_hasperm(&self.inner.lock().perm, cred, req)
    }
}

impl SysvSem {
    pub(crate) fn perm(&self) -> IpcPerm {
        self.inner.lock().perm
    }

    /// Waiters currently enqueued, for invariant checks.
    pub fn waiter_count(&self) -> usize {
        self.waitq.waiter_count()
    }
}

/// Applies `ops` in order against `values`.
///
/// On a blocking condition or range overflow, returns the index of the
/// offending operation; the caller rolls back the prefix.
fn process_ops(values: &mut [SemVal], ops: &[Sembuf]) -> Result<(), (usize, SysError)> {
    for (i, op) in ops.iter().enumerate() {
        let val = &mut values[op.sem_num as usize];
        if op.sem_op == 0 {
            if val.value != 0 {
                return Err((i, SysError::EAGAIN));
            }
            continue;
        }
        if op.sem_op < 0 {
            let dec = (-(op.sem_op as i32)) as u16;
            if val.value < dec {
                return Err((i, SysError::EAGAIN));
            }
            val.value -= dec;
        } else {
            let inc = op.sem_op as u16;
            if inc > SEMVMX - val.value {
                return Err((i, SysError::ERANGE));
            }
            val.value += inc;
        }
    }
    Ok(())
}

/// Undoes the first `count` operations of `ops`, in reverse.
fn rollback_ops(values: &mut [SemVal], ops: &[Sembuf], count: usize) {
    for op in ops[..count].iter().rev() {
        let val = &mut values[op.sem_num as usize];
        val.value = (val.value as i32 - op.sem_op as i32) as u16;
    }
}

/// `semget`: find or create the set bound to `key` with `nsems`
/// semaphores, all zero.
pub fn semget(cred: &Cred, key: i32, nsems: usize, flags: i32) -> SyscallResult {
    if nsems > SEMMSL {
        return Err(SysError::EINVAL);
    }
    if flags & !(IpcGetFlags::all().bits() | 0o777) != 0 {
        return Err(SysError::EINVAL);
    }
    let get_flags = IpcGetFlags::from_bits_truncate(flags);
    let mode = (flags & 0o777) as u16;
    let cred = *cred;
    let id = sysv_get(&SEM_TABLE, key, get_flags, &cred, move |id, seq| {
        Ok(Arc::new(SysvSem {
            id,
            key,
            removed: AtomicBool::new(false),
            inner: SpinLock::new(SemInner {
                perm: new_perm(key, &cred, mode, seq),
                otime: 0,
                ctime: realtime_seconds(),
                values: vec![SemVal::default(); nsems],
            }),
            waitq: WaitQueue::new(),
        }))
    })?;
    Ok(id as usize)
}

/// `semtimedop`: atomically apply `ops`, blocking until possible.
///
/// If an operation cannot proceed, the already-applied prefix is rolled
/// back and the caller sleeps (unless that operation carries `IPC_NOWAIT`),
/// to retry the whole transaction on wakeup. `deadline_ms` bounds each
/// sleep on the monotonic clock.
pub fn semtimedop(
    cred: &Cred,
    pid: usize,
    id: i32,
    ops: &[Sembuf],
    deadline_ms: Option<u64>,
) -> SyscallResult {
    if ops.is_empty() {
        return Err(SysError::EINVAL);
    }
    if ops.len() > SEMOPM {
        return Err(SysError::E2BIG);
    }
    let sem = SEM_TABLE.acquire(id).ok_or(SysError::EINVAL)?;
    if sem.removed() {
        return Err(SysError::EIDRM);
    }
    let mut guard = sem.inner.lock();
    let mut req = 0u16;
    for op in ops {
        if (op.sem_num as usize) >= guard.values.len() {
            return Err(SysError::EFBIG);
        }
        if op.sem_flg & !SemFlags::all().bits() != 0 {
            return Err(SysError::EINVAL);
        }
        req |= if op.sem_op != 0 { 0o2 } else { 0o4 };
    }
    ipc_hasperm(&guard.perm, cred, req)?;

    loop {
        match process_ops(&mut guard.values, ops) {
            Ok(()) => {
                for op in ops {
                    guard.values[op.sem_num as usize].pid = pid;
                }
                guard.otime = realtime_seconds();
                sem.waitq.broadcast(Ok(()));
                return Ok(0);
            }
            Err((blocked, SysError::EAGAIN)) => {
                rollback_ops(&mut guard.values, ops, blocked);
                let op = &ops[blocked];
                if SemFlags::from_bits_truncate(op.sem_flg).contains(SemFlags::IPC_NOWAIT) {
                    return Err(SysError::EAGAIN);
                }
                let idx = op.sem_num as usize;
                if op.sem_op != 0 {
                    guard.values[idx].ncnt += 1;
                } else {
                    guard.values[idx].zcnt += 1;
                }
                let (reacquired, res) = sem.waitq.wait_locked(guard, deadline_ms);
                guard = reacquired;
                if op.sem_op != 0 {
                    guard.values[idx].ncnt -= 1;
                } else {
                    guard.values[idx].zcnt -= 1;
                }
                res?;
            }
            Err((blocked, err)) => {
                rollback_ops(&mut guard.values, ops, blocked);
                return Err(err);
            }
        }
    }
}

fn acquire_live(id: i32) -> SysResult<super::IpcRef<'static, SysvSem>> {
    let sem = SEM_TABLE.acquire(id).ok_or(SysError::EINVAL)?;
    if sem.removed() {
        return Err(SysError::EIDRM);
    }
    Ok(sem)
}

/// `semctl(IPC_STAT)`.
pub fn sem_stat(cred: &Cred, id: i32) -> SysResult<SemidDs> {
    let sem = acquire_live(id)?;
    let inner = sem.inner.lock();
    ipc_hasperm(&inner.perm, cred, 0o4)?;
    Ok(SemidDs {
        sem_perm: inner.perm,
        sem_otime: inner.otime,
        sem_ctime: inner.ctime,
        sem_nsems: inner.values.len(),
    })
}

/// `semctl(IPC_SET)`: owner-only update of uid, gid and the low mode bits.
pub fn sem_set(cred: &Cred, id: i32, uid: u32, gid: u32, mode: u16) -> SyscallResult {
    let sem = acquire_live(id)?;
    let mut inner = sem.inner.lock();
    ipc_isowner(&inner.perm, cred)?;
    inner.perm.uid = uid;
    inner.perm.gid = gid;
    inner.perm.mode = (inner.perm.mode & !0o777) | (mode & 0o777);
    inner.ctime = realtime_seconds();
    Ok(0)
}

/// `semctl(IPC_RMID)`: owner-only removal; every sleeper wakes with
/// `EIDRM`.
pub fn sem_remove(cred: &Cred, id: i32) -> SyscallResult {
    let sem = acquire_live(id)?;
    {
        let inner = sem.inner.lock();
        ipc_isowner(&inner.perm, cred)?;
        sem.removed.store(true, Ordering::Release);
        sem.waitq.broadcast(Err(SysError::EIDRM));
    }
    SEM_TABLE.unbind_key(id);
    Ok(0)
}

/// Number of semaphores in the set, for sizing user transfers.
pub(crate) fn sem_nsems(id: i32) -> SysResult<usize> {
    let sem = acquire_live(id)?;
    let inner = sem.inner.lock();
    Ok(inner.values.len())
}

/// `semctl(GETALL)`.
pub fn sem_getall(cred: &Cred, id: i32) -> SysResult<Vec<u16>> {
    let sem = acquire_live(id)?;
    let inner = sem.inner.lock();
    ipc_hasperm(&inner.perm, cred, 0o4)?;
    Ok(inner.values.iter().map(|v| v.value).collect())
}

/// `semctl(SETALL)`: any changed value wakes every sleeper for a retry.
pub fn sem_setall(cred: &Cred, id: i32, values: &[u16]) -> SyscallResult {
    let sem = acquire_live(id)?;
    let mut inner = sem.inner.lock();
    ipc_hasperm(&inner.perm, cred, 0o2)?;
    if values.len() != inner.values.len() {
        return Err(SysError::EINVAL);
    }
    let mut changed = false;
    for (slot, &value) in inner.values.iter_mut().zip(values) {
        if slot.value != value {
            slot.value = value;
            changed = true;
        }
    }
    if changed {
        sem.waitq.broadcast(Ok(()));
    }
    Ok(0)
}

fn with_semval<R>(
    cred: &Cred,
    id: i32,
    semnum: i32,
    read: impl FnOnce(&SemVal) -> R,
) -> SysResult<R> {
    let sem = acquire_live(id)?;
    let inner = sem.inner.lock();
    ipc_hasperm(&inner.perm, cred, 0o4)?;
    if semnum < 0 || semnum as usize >= inner.values.len() {
        return Err(SysError::EINVAL);
    }
    Ok(read(&inner.values[semnum as usize]))
}

/// `semctl(GETVAL)`.
pub fn sem_getval(cred: &Cred, id: i32, semnum: i32) -> SyscallResult {
    with_semval(cred, id, semnum, |v| v.value as usize)
}

/// `semctl(GETPID)`.
pub fn sem_getpid(cred: &Cred, id: i32, semnum: i32) -> SyscallResult {
    with_semval(cred, id, semnum, |v| v.pid)
}

/// `semctl(GETNCNT)`.
pub fn sem_getncnt(cred: &Cred, id: i32, semnum: i32) -> SyscallResult {
    with_semval(cred, id, semnum, |v| v.ncnt as usize)
}

/// `semctl(GETZCNT)`.
pub fn sem_getzcnt(cred: &Cred, id: i32, semnum: i32) -> SyscallResult {
    with_semval(cred, id, semnum, |v| v.zcnt as usize)
}

/// `semctl(SETVAL)`: set one value, waking sleepers when it changes.
pub fn sem_setval(cred: &Cred, id: i32, semnum: i32, value: i32) -> SyscallResult {
    let sem = acquire_live(id)?;
    let mut inner = sem.inner.lock();
    ipc_hasperm(&inner.perm, cred, 0o2)?;
    if semnum < 0 || semnum as usize >= inner.values.len() {
        return Err(SysError::EINVAL);
    }
    if value < 0 || value > SEMVMX as i32 {
        return Err(SysError::EINVAL);
    }
    let slot = &mut inner.values[semnum as usize];
    if slot.value != value as u16 {
        slot.value = value as u16;
        sem.waitq.broadcast(Ok(()));
    }
    Ok(0)
}
