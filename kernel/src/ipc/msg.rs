//! System V message queues.
//!
//! A queue is a FIFO of typed messages bounded by a byte budget. Senders
//! block while the budget cannot take the new message; receivers block
//! until a message matches their selector. Both directions sleep on their
//! own wait queue and are woken broadly, since whether a particular waiter
//! can proceed depends on its own message size or selector.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::collections::VecDeque;

use config::ipc::{MSGMAX, MSGMNB, MSGMNI};
use mutex::{SpinLock, WaitQueue};
use spin::Lazy;
use systype::{
    ipc::{Cred, IpcGetFlags, IpcPerm, MsgFlags, MsgidDs},
    SysError, SysResult, SyscallResult,
};
use timer::realtime_seconds;

use super::{ipc_hasperm, ipc_isowner, new_perm, sysv_get, IpcObject, IpcTable};

pub(crate) static MSG_TABLE: Lazy<IpcTable<SysvMsg>> = Lazy::new(|| IpcTable::new(MSGMNI));

/// One queued message.
struct MsgBuf {
    mtype: i64,
    data: Vec<u8>,
}

/// A message queue.
pub struct SysvMsg {
    id: i32,
    key: i32,
    removed: AtomicBool,
    inner: SpinLock<MsgInner>,
    /// Receivers sleeping for a matching message.
    rwaitq: WaitQueue,
    /// Senders sleeping for budget.
    wwaitq: WaitQueue,
}

struct MsgInner {
    perm: IpcPerm,
    stime: u64,
    rtime: u64,
    ctime: u64,
    /// Sum of the queued payload sizes.
    cbytes: usize,
    /// Byte budget.
    qbytes: usize,
    lspid: usize,
    lrpid: usize,
    queue: VecDeque<MsgBuf>,
}

impl IpcObject for SysvMsg {
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

impl SysvMsg {
    pub(crate) fn perm(&self) -> IpcPerm {
        self.inner.lock().perm
    }
}

/// `msgget`: find or create the queue bound to `key`, with the default
/// byte budget.
pub fn msgget(cred: &Cred, key: i32, flags: i32) -> SyscallResult {
    if flags & !(IpcGetFlags::all().bits() | 0o777) != 0 {
        return Err(SysError::EINVAL);
    }
    let get_flags = IpcGetFlags::from_bits_truncate(flags);
    let mode = (flags & 0o777) as u16;
    let cred = *cred;
    let id = sysv_get(&MSG_TABLE, key, get_flags, &cred, move |id, seq| {
        Ok(Arc::new(SysvMsg {
            id,
            key,
            removed: AtomicBool::new(false),
            inner: SpinLock::new(MsgInner {
                perm: new_perm(key, &cred, mode, seq),
                stime: 0,
                rtime: 0,
                ctime: realtime_seconds(),
                cbytes: 0,
                qbytes: MSGMNB,
                lspid: 0,
                lrpid: 0,
                queue: VecDeque::new(),
            }),
            rwaitq: WaitQueue::new(),
            wwaitq: WaitQueue::new(),
        }))
    })?;
    Ok(id as usize)
}

/// `msgsnd`: append a message, sleeping while the byte budget is short.
pub fn msgsnd(
    cred: &Cred,
    pid: usize,
    id: i32,
    mtype: i64,
    data: Vec<u8>,
    flags: MsgFlags,
    deadline_ms: Option<u64>,
) -> SyscallResult {
    if flags.intersects(!MsgFlags::IPC_NOWAIT) {
        return Err(SysError::EINVAL);
    }
    if data.len() > MSGMAX {
        return Err(SysError::EINVAL);
    }
    let msg = MSG_TABLE.acquire(id).ok_or(SysError::EINVAL)?;
    if msg.removed() {
        return Err(SysError::EIDRM);
    }
    let mut guard = msg.inner.lock();
    ipc_hasperm(&guard.perm, cred, 0o2)?;
    while guard.qbytes - guard.cbytes < data.len() {
        if flags.contains(MsgFlags::IPC_NOWAIT) {
            return Err(SysError::EAGAIN);
        }
        let (reacquired, res) = msg.wwaitq.wait_locked(guard, deadline_ms);
        guard = reacquired;
        res?;
    }
    guard.cbytes += data.len();
    guard.stime = realtime_seconds();
    guard.lspid = pid;
    guard.queue.push_back(MsgBuf { mtype, data });
    msg.rwaitq.broadcast(Ok(()));
    Ok(0)
}

/// Picks the queued message matching `mtype_sel`, by index.
fn select_message(queue: &VecDeque<MsgBuf>, mtype_sel: i64, flags: MsgFlags) -> Option<usize> {
    if mtype_sel == 0 {
        return if queue.is_empty() { None } else { Some(0) };
    }
    if mtype_sel > 0 {
        if flags.contains(MsgFlags::MSG_EXCEPT) {
            queue.iter().position(|m| m.mtype != mtype_sel)
        } else {
            queue.iter().position(|m| m.mtype == mtype_sel)
        }
    } else {
        // Smallest mtype not exceeding |mtype_sel|.
        let limit = mtype_sel.checked_neg().unwrap_or(i64::MAX);
        queue
            .iter()
            .enumerate()
            .filter(|(_, m)| m.mtype <= limit)
            .min_by_key(|(_, m)| m.mtype)
            .map(|(i, _)| i)
    }
}

/// `msgrcv`: remove and return a message selected by `mtype_sel`.
///
/// Returns the message type and its payload truncated to `bufsize` (only
/// with `MSG_NOERROR`; otherwise an oversized match fails with `E2BIG` and
/// stays queued).
pub fn msgrcv(
    cred: &Cred,
    pid: usize,
    id: i32,
    bufsize: usize,
    mtype_sel: i64,
    flags: MsgFlags,
    deadline_ms: Option<u64>,
) -> SysResult<(i64, Vec<u8>)> {
    if flags.intersects(!(MsgFlags::IPC_NOWAIT | MsgFlags::MSG_NOERROR | MsgFlags::MSG_EXCEPT)) {
        return Err(SysError::EINVAL);
    }
    let msg = MSG_TABLE.acquire(id).ok_or(SysError::EINVAL)?;
    if msg.removed() {
        return Err(SysError::EIDRM);
    }
    let mut guard = msg.inner.lock();
    ipc_hasperm(&guard.perm, cred, 0o4)?;
    loop {
        if let Some(index) = select_message(&guard.queue, mtype_sel, flags) {
            let size = guard.queue[index].data.len();
            if size > bufsize && !flags.contains(MsgFlags::MSG_NOERROR) {
                return Err(SysError::E2BIG);
            }
            let mut buf = guard.queue.remove(index).unwrap();
            buf.data.truncate(bufsize.min(size));
            guard.cbytes -= size;
            guard.rtime = realtime_seconds();
            guard.lrpid = pid;
            msg.wwaitq.broadcast(Ok(()));
            return Ok((buf.mtype, buf.data));
        }
        if flags.contains(MsgFlags::IPC_NOWAIT) {
            return Err(SysError::ENOMSG);
        }
        let (reacquired, res) = msg.rwaitq.wait_locked(guard, deadline_ms);
        guard = reacquired;
        res?;
    }
}

fn acquire_live(id: i32) -> SysResult<super::IpcRef<'static, SysvMsg>> {
    let msg = MSG_TABLE.acquire(id).ok_or(SysError::EINVAL)?;
    if msg.removed() {
        return Err(SysError::EIDRM);
    }
    Ok(msg)
}

/// `msgctl(IPC_STAT)`.
pub fn msg_stat(cred: &Cred, id: i32) -> SysResult<MsgidDs> {
    let msg = acquire_live(id)?;
    let inner = msg.inner.lock();
    ipc_hasperm(&inner.perm, cred, 0o4)?;
    Ok(MsgidDs {
        msg_perm: inner.perm,
        msg_stime: inner.stime,
        msg_rtime: inner.rtime,
        msg_ctime: inner.ctime,
        msg_cbytes: inner.cbytes,
        msg_qnum: inner.queue.len(),
        msg_qbytes: inner.qbytes,
        msg_lspid: inner.lspid,
        msg_lrpid: inner.lrpid,
    })
}

/// `msgctl(IPC_SET)`: owner-only update of uid, gid, the low mode bits and
/// the byte budget, the latter capped by the admin limit.
pub fn msg_set(
    cred: &Cred,
    id: i32,
    uid: u32,
    gid: u32,
    mode: u16,
    qbytes: usize,
) -> SyscallResult {
    let msg = acquire_live(id)?;
    let mut inner = msg.inner.lock();
    ipc_isowner(&inner.perm, cred)?;
    if qbytes > MSGMNB {
        return Err(SysError::EPERM);
    }
    inner.perm.uid = uid;
    inner.perm.gid = gid;
    inner.perm.mode = (inner.perm.mode & !0o777) | (mode & 0o777);
    inner.qbytes = qbytes;
    inner.ctime = realtime_seconds();
    // A grown budget may admit sleeping senders.
    msg.wwaitq.broadcast(Ok(()));
    Ok(0)
}

/// `msgctl(IPC_RMID)`: owner-only removal; sleepers on both sides wake
/// with `EIDRM`.
pub fn msg_remove(cred: &Cred, id: i32) -> SyscallResult {
    let msg = acquire_live(id)?;
    {
        let inner = msg.inner.lock();
        ipc_isowner(&inner.perm, cred)?;
        msg.removed.store(true, Ordering::Release);
        msg.rwaitq.broadcast(Err(SysError::EIDRM));
        msg.wwaitq.broadcast(Err(SysError::EIDRM));
    }
    MSG_TABLE.unbind_key(id);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use std::thread;
    use systype::ipc::IPC_PRIVATE;

    const CRED: Cred = Cred {
        euid: 100,
        egid: 100,
    };

    fn send(id: i32, mtype: i64, data: &[u8]) -> SyscallResult {
        msgsnd(
            &CRED,
            1,
            id,
            mtype,
            data.to_vec(),
            MsgFlags::empty(),
            None,
        )
    }

    #[test]
    fn selective_receive() {
        // S3: receive by type, then by smallest-below.
        let id = msgget(&CRED, IPC_PRIVATE, 0o600).unwrap() as i32;
        send(id, 1, b"a").unwrap();
        send(id, 2, b"bb").unwrap();
        send(id, 1, b"ccc").unwrap();

        let (mtype, data) = msgrcv(&CRED, 2, id, 4, 2, MsgFlags::empty(), None).unwrap();
        assert_eq!((mtype, data.as_slice()), (2, b"bb".as_slice()));

        let (mtype, data) = msgrcv(&CRED, 2, id, 4, -1, MsgFlags::empty(), None).unwrap();
        assert_eq!((mtype, data.as_slice()), (1, b"a".as_slice()));

        let ds = msg_stat(&CRED, id).unwrap();
        assert_eq!(ds.msg_qnum, 1);
        assert_eq!(ds.msg_cbytes, 3);
        let (mtype, data) = msgrcv(&CRED, 2, id, 4, 0, MsgFlags::empty(), None).unwrap();
        assert_eq!((mtype, data.as_slice()), (1, b"ccc".as_slice()));
    }

    #[test]
    fn except_and_smallest_selectors() {
        let id = msgget(&CRED, IPC_PRIVATE, 0o600).unwrap() as i32;
        send(id, 5, b"five").unwrap();
        send(id, 3, b"three").unwrap();
        send(id, 4, b"four").unwrap();

        let (mtype, _) = msgrcv(&CRED, 2, id, 8, 5, MsgFlags::MSG_EXCEPT, None).unwrap();
        assert_eq!(mtype, 3);
        // Smallest type not exceeding 9 is now 4, not the queue head.
        let (mtype, _) = msgrcv(&CRED, 2, id, 8, -9, MsgFlags::empty(), None).unwrap();
        assert_eq!(mtype, 4);
        // No message of type <= 2.
        assert_eq!(
            msgrcv(&CRED, 2, id, 8, -2, MsgFlags::IPC_NOWAIT, None).unwrap_err(),
            SysError::ENOMSG
        );
    }

    #[test]
    fn oversized_messages_stay_queued_without_noerror() {
        let id = msgget(&CRED, IPC_PRIVATE, 0o600).unwrap() as i32;
        send(id, 1, b"payload").unwrap();
        assert_eq!(
            msgrcv(&CRED, 2, id, 3, 1, MsgFlags::empty(), None).unwrap_err(),
            SysError::E2BIG
        );
        assert_eq!(msg_stat(&CRED, id).unwrap().msg_qnum, 1);
        let (_, data) = msgrcv(&CRED, 2, id, 3, 1, MsgFlags::MSG_NOERROR, None).unwrap();
        assert_eq!(data.as_slice(), b"pay");
        assert_eq!(msg_stat(&CRED, id).unwrap().msg_cbytes, 0);
    }

    #[test]
    fn budget_blocks_senders_and_removal_unblocks() {
        // S6 with the budget shrunk to 16 bytes.
        let id = msgget(&CRED, IPC_PRIVATE, 0o600).unwrap() as i32;
        msg_set(&CRED, id, 100, 100, 0o600, 16).unwrap();
        send(id, 1, &[0u8; 10]).unwrap();
        assert_eq!(
            msgsnd(
                &CRED,
                1,
                id,
                1,
                vec![0u8; 10],
                MsgFlags::IPC_NOWAIT,
                None
            )
            .unwrap_err(),
            SysError::EAGAIN
        );

        let sender = thread::spawn(move || {
            msgsnd(&CRED, 1, id, 1, vec![0u8; 10], MsgFlags::empty(), None)
        });
        // Wait until the sender blocks, then remove the queue under it.
        loop {
            let msg = MSG_TABLE.acquire(id).unwrap();
            if msg.wwaitq.waiter_count() > 0 {
                break;
            }
            drop(msg);
            thread::yield_now();
        }
        msg_remove(&CRED, id).unwrap();
        assert_eq!(sender.join().unwrap().unwrap_err(), SysError::EIDRM);
    }

    #[test]
    fn receiver_blocks_until_send() {
        let id = msgget(&CRED, IPC_PRIVATE, 0o600).unwrap() as i32;
        let receiver =
            thread::spawn(move || msgrcv(&CRED, 2, id, 16, 7, MsgFlags::empty(), None).unwrap());
        loop {
            let msg = MSG_TABLE.acquire(id).unwrap();
            if msg.rwaitq.waiter_count() > 0 {
                break;
            }
            drop(msg);
            thread::yield_now();
        }
        // A non-matching message does not release the receiver.
        send(id, 1, b"noise").unwrap();
        thread::yield_now();
        send(id, 7, b"signal").unwrap();
        let (mtype, data) = receiver.join().unwrap();
        assert_eq!((mtype, data.as_slice()), (7, b"signal".as_slice()));
        assert_eq!(msg_stat(&CRED, id).unwrap().msg_qnum, 1);
    }

    #[test]
    fn qbytes_cap_and_oversized_sends() {
        let id = msgget(&CRED, IPC_PRIVATE, 0o600).unwrap() as i32;
        assert_eq!(
            msg_set(&CRED, id, 100, 100, 0o600, MSGMNB + 1).unwrap_err(),
            SysError::EPERM
        );
        assert_eq!(
            send(id, 1, &vec![0u8; MSGMAX + 1]).unwrap_err(),
            SysError::EINVAL
        );
    }
}
