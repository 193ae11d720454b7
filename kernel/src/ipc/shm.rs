//! System V shared memory.
//!
//! A segment owns a page cache (one optional frame per page, allocated and
//! zeroed on first fault) and is attached into an address space as a
//! shared zone whose faults resolve against that cache. The attach count
//! drives the deferred-removal rule: a removed segment is freed only once
//! nothing references it and nothing maps it. Following the Linux
//! allowance, a removed segment can still be attached by whoever holds its
//! id; `shmctl` on it reports `EIDRM`.

use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use config::{
    ipc::{SHMMAX, SHMMIN, SHMMNI},
    mm::{PAGE_MASK, PAGE_SIZE},
};
use mm::{address::VirtAddr, frame::Frame};
use mutex::SpinLock;
use spin::Lazy;
use systype::{
    ipc::{Cred, IpcGetFlags, IpcPerm, ShmAtFlags, ShmidDs},
    memory_flags::MemProt,
    SysError, SysResult, SyscallResult,
};
use timer::realtime_seconds;

use crate::vm::AddrSpace;

use super::{ipc_hasperm, ipc_isowner, new_perm, sysv_get, IpcObject, IpcTable};

pub(crate) static SHM_TABLE: Lazy<IpcTable<SysvShm>> = Lazy::new(|| IpcTable::new(SHMMNI));

/// A shared memory segment.
pub struct SysvShm {
    id: i32,
    key: i32,
    removed: AtomicBool,
    /// Number of zones mapping this segment across all address spaces.
    nattch: AtomicUsize,
    inner: SpinLock<ShmInner>,
    /// Page cache, one slot per page of the segment. Its own lock keeps the
    /// fault path off the status lock.
    pages: SpinLock<Vec<Option<Arc<Frame>>>>,
}

struct ShmInner {
    perm: IpcPerm,
    segsz: usize,
    atime: u64,
    dtime: u64,
    ctime: u64,
    cpid: usize,
    lpid: usize,
}

impl IpcObject for SysvShm {
    fn id(&self) -> i32 {
        self.id
    }
    fn key(&self) -> i32 {
        self.key
    }
    fn removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
    fn removal_ready(&self) -> bool {
        self.nattch.load(Ordering::Acquire) == 0
    }
    fn hasperm(&self, cred: &Cred, req: u16) -> SysResult<()> {
        ipc_hasperm(&self.inner.lock().perm, cred, req)
    }
}

impl SysvShm {
    /// Current attach count.
    pub fn nattch(&self) -> usize {
        self.nattch.load(Ordering::Acquire)
    }

    pub(crate) fn perm(&self) -> IpcPerm {
        self.inner.lock().perm
    }

    fn to_ds(&self) -> ShmidDs {
        let inner = self.inner.lock();
        ShmidDs {
            shm_perm: inner.perm,
            shm_segsz: inner.segsz,
            shm_atime: inner.atime,
            shm_dtime: inner.dtime,
            shm_ctime: inner.ctime,
            shm_cpid: inner.cpid,
            shm_lpid: inner.lpid,
            shm_nattch: self.nattch(),
        }
    }
}

/// `shmget`: find or create the segment bound to `key`.
///
/// The size is rounded up to a page multiple and checked against the
/// configured bounds on creation only; looking up an existing segment
/// ignores it.
pub fn shmget(cred: &Cred, pid: usize, key: i32, size: usize, flags: i32) -> SyscallResult {
    if flags & !(IpcGetFlags::all().bits() | 0o777) != 0 {
        return Err(SysError::EINVAL);
    }
    let size = (size + PAGE_MASK) & !PAGE_MASK;
    let get_flags = IpcGetFlags::from_bits_truncate(flags);
    let mode = (flags & 0o777) as u16;
    let cred = *cred;
    let id = sysv_get(&SHM_TABLE, key, get_flags, &cred, move |id, seq| {
        if size < SHMMIN || size > SHMMAX {
            return Err(SysError::EINVAL);
        }
        Ok(Arc::new(SysvShm {
            id,
            key,
            removed: AtomicBool::new(false),
            nattch: AtomicUsize::new(0),
            inner: SpinLock::new(ShmInner {
                perm: new_perm(key, &cred, mode, seq),
                segsz: size,
                atime: 0,
                dtime: 0,
                ctime: realtime_seconds(),
                cpid: pid,
                lpid: 0,
            }),
            pages: SpinLock::new(vec![None; size / PAGE_SIZE]),
        }))
    })?;
    Ok(id as usize)
}

/// `shmat`: map the segment into `space` and record the binding.
///
/// A caller-supplied address is refused; the space picks the placement.
/// Attaching a removed-but-live segment is allowed.
pub fn shmat(
    _cred: &Cred,
    pid: usize,
    space: &Arc<AddrSpace>,
    id: i32,
    addr: usize,
    flags: i32,
) -> SyscallResult {
    if flags & !ShmAtFlags::all().bits() != 0 {
        return Err(SysError::EINVAL);
    }
    let flags = ShmAtFlags::from_bits_truncate(flags);
    if addr != 0 {
        return Err(SysError::EINVAL);
    }
    let shm = SHM_TABLE.acquire(id).ok_or(SysError::EINVAL)?;
    let mut prot = MemProt::R;
    if !flags.contains(ShmAtFlags::SHM_RDONLY) {
        prot |= MemProt::W;
    }
    let mut inner = shm.inner.lock();
    let mapped = space.map_shm(id, inner.segsz, prot)?;
    shm.nattch.fetch_add(1, Ordering::AcqRel);
    inner.atime = realtime_seconds();
    inner.lpid = pid;
    Ok(mapped.to_usize())
}

/// `shmdt`: unmap the segment attached at `addr`.
pub fn shmdt(pid: usize, space: &Arc<AddrSpace>, addr: usize) -> SyscallResult {
    if addr & PAGE_MASK != 0 {
        return Err(SysError::EINVAL);
    }
    let addr = VirtAddr::new(addr);
    let binding = space.shm_binding_at(addr).ok_or(SysError::EINVAL)?;
    let shm = SHM_TABLE.acquire(binding.shm_id).ok_or(SysError::EINVAL)?;
    space.remove_shm_binding(addr);
    // Freeing the zone runs the detach bookkeeping.
    space.free(binding.addr, binding.size)?;
    let mut inner = shm.inner.lock();
    inner.dtime = realtime_seconds();
    inner.lpid = pid;
    Ok(0)
}

/// `shmctl(IPC_STAT)`.
pub fn shm_stat(cred: &Cred, id: i32) -> SysResult<ShmidDs> {
    let shm = SHM_TABLE.acquire(id).ok_or(SysError::EINVAL)?;
    if shm.removed() {
        return Err(SysError::EIDRM);
    }
    shm.hasperm(cred, 0o4)?;
    Ok(shm.to_ds())
}

/// `shmctl(IPC_SET)`: owner-only update of uid, gid and the low mode bits.
pub fn shm_set(cred: &Cred, id: i32, uid: u32, gid: u32, mode: u16) -> SyscallResult {
    let shm = SHM_TABLE.acquire(id).ok_or(SysError::EINVAL)?;
    if shm.removed() {
        return Err(SysError::EIDRM);
    }
    let mut inner = shm.inner.lock();
    ipc_isowner(&inner.perm, cred)?;
    inner.perm.uid = uid;
    inner.perm.gid = gid;
    inner.perm.mode = (inner.perm.mode & !0o777) | (mode & 0o777);
    inner.ctime = realtime_seconds();
    Ok(0)
}

/// `shmctl(IPC_RMID)`: owner-only removal mark. The segment lives on while
/// attached or referenced and its key stops resolving once freed.
pub fn shm_remove(cred: &Cred, id: i32) -> SyscallResult {
    let shm = SHM_TABLE.acquire(id).ok_or(SysError::EINVAL)?;
    if shm.removed() {
        return Err(SysError::EIDRM);
    }
    {
        let inner = shm.inner.lock();
        ipc_isowner(&inner.perm, cred)?;
    }
    shm.removed.store(true, Ordering::Release);
    SHM_TABLE.unbind_key(id);
    Ok(0)
}

/// Zone hook: a new zone maps the segment (split sibling, fork).
pub(crate) fn zone_open(id: i32) {
    if let Some(shm) = SHM_TABLE.acquire(id) {
        shm.nattch.fetch_add(1, Ordering::AcqRel);
    }
}

/// Zone hook: a mapping zone went away.
pub(crate) fn zone_close(id: i32) {
    let Some(shm) = SHM_TABLE.acquire(id) else {
        return;
    };
    let prev = shm.nattch.fetch_sub(1, Ordering::AcqRel);
    if prev == 0 {
        panic!("shm {}: negative nattch", id);
    }
    // Dropping the reference re-runs the removal check.
}

/// Zone hook: fault in the page at byte offset `off` of the segment.
pub(crate) fn zone_fault(id: i32, off: usize) -> SysResult<Arc<Frame>> {
    let shm = SHM_TABLE.acquire(id).ok_or(SysError::EINVAL)?;
    let index = off / PAGE_SIZE;
    let mut pages = shm.pages.lock();
    if index >= pages.len() {
        return Err(SysError::EOVERFLOW);
    }
    if let Some(frame) = &pages[index] {
        return Ok(Arc::clone(frame));
    }
    let frame = Arc::new(Frame::build()?);
    pages[index] = Some(Arc::clone(&frame));
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use systype::ipc::IPC_PRIVATE;

    const CRED: Cred = Cred {
        euid: 100,
        egid: 100,
    };

    #[test]
    fn attach_share_detach_remove() {
        // Two processes share a key'd segment; writes through one mapping
        // are visible through the other; removal defers until the last
        // detach.
        let key = 0x5151;
        let id = shmget(&CRED, 1, key, 2 * PAGE_SIZE + 1, 0o600 | (1 << 9)).unwrap() as i32;
        let p1 = AddrSpace::build_user();
        let p2 = AddrSpace::build_user();

        let a1 = shmat(&CRED, 1, &p1, id, 0, 0).unwrap();
        p1.copy_out(VirtAddr::new(a1 + 5), &[0x55]).unwrap();

        let id2 = shmget(&CRED, 2, key, 0, 0o600).unwrap() as i32;
        assert_eq!(id2, id);
        let a2 = shmat(&CRED, 2, &p2, id2, 0, ShmAtFlags::SHM_RDONLY.bits()).unwrap();
        let mut byte = [0u8];
        p2.copy_in(VirtAddr::new(a2 + 5), &mut byte).unwrap();
        assert_eq!(byte[0], 0x55);
        // The read-only attach refuses writes.
        assert_eq!(
            p2.copy_out(VirtAddr::new(a2 + 5), &[0]).unwrap_err(),
            SysError::EFAULT
        );

        let shm = SHM_TABLE.acquire(id).unwrap();
        assert_eq!(shm.nattch(), 2);
        drop(shm);

        shmdt(1, &p1, a1).unwrap();
        shm_remove(&CRED, id).unwrap();
        // The key no longer resolves.
        assert_eq!(
            shmget(&CRED, 1, key, 0, 0o600).unwrap_err(),
            SysError::ENOENT
        );
        // Still attached in P2, the data survives.
        p2.copy_in(VirtAddr::new(a2 + 5), &mut byte).unwrap();
        assert_eq!(byte[0], 0x55);

        shmdt(2, &p2, a2).unwrap();
        assert!(SHM_TABLE.acquire(id).is_none());
    }

    #[test]
    fn stat_and_ctl_permissions() {
        let id = shmget(&CRED, 42, IPC_PRIVATE, PAGE_SIZE, 0o600).unwrap() as i32;
        let ds = shm_stat(&CRED, id).unwrap();
        assert_eq!(ds.shm_segsz, PAGE_SIZE);
        assert_eq!(ds.shm_cpid, 42);
        assert_eq!(ds.shm_nattch, 0);

        let stranger = Cred { euid: 7, egid: 7 };
        assert_eq!(shm_stat(&stranger, id).unwrap_err(), SysError::EACCES);
        assert_eq!(
            shm_set(&stranger, id, 7, 7, 0o777).unwrap_err(),
            SysError::EPERM
        );
        assert_eq!(shm_remove(&stranger, id).unwrap_err(), SysError::EPERM);

        shm_set(&CRED, id, 100, 100, 0o644).unwrap();
        assert_eq!(shm_stat(&CRED, id).unwrap().shm_perm.mode, 0o644);

        shm_remove(&CRED, id).unwrap();
        // Every further shmctl on the removed segment reports EIDRM.
        assert_eq!(shm_stat(&CRED, id).unwrap_err(), SysError::EIDRM);
        assert_eq!(shm_remove(&CRED, id).unwrap_err(), SysError::EIDRM);
    }

    #[test]
    fn attach_after_removal_is_allowed_while_live() {
        let id = shmget(&CRED, 1, IPC_PRIVATE, PAGE_SIZE, 0o600).unwrap() as i32;
        let space = AddrSpace::build_user();
        let addr = shmat(&CRED, 1, &space, id, 0, 0).unwrap();
        shm_remove(&CRED, id).unwrap();
        // The id is still usable by an attached process.
        let again = shmat(&CRED, 1, &space, id, 0, 0).unwrap();
        assert_ne!(addr, again);
        shmdt(1, &space, addr).unwrap();
        shmdt(1, &space, again).unwrap();
        assert!(SHM_TABLE.acquire(id).is_none());
    }

    #[test]
    fn fork_keeps_segment_shared() {
        let id = shmget(&CRED, 3, IPC_PRIVATE, PAGE_SIZE, 0o600).unwrap() as i32;
        let parent = AddrSpace::build_user();
        let addr = shmat(&CRED, 3, &parent, id, 0, 0).unwrap();
        parent.copy_out(VirtAddr::new(addr), &[0xAB]).unwrap();

        let child = parent.dup();
        {
            let shm = SHM_TABLE.acquire(id).unwrap();
            assert_eq!(shm.nattch(), 2);
        }
        // Writes remain shared in both directions, unlike private COW.
        child.copy_out(VirtAddr::new(addr), &[0xCD]).unwrap();
        let mut byte = [0u8];
        parent.copy_in(VirtAddr::new(addr), &mut byte).unwrap();
        assert_eq!(byte[0], 0xCD);

        drop(child);
        let shm = SHM_TABLE.acquire(id).unwrap();
        assert_eq!(shm.nattch(), 1);
        drop(shm);
        drop(parent);
        let shm = SHM_TABLE.acquire(id).unwrap();
        assert_eq!(shm.nattch(), 0);
    }

    #[test]
    fn anchored_attach_and_bad_sizes_are_refused() {
        let id = shmget(&CRED, 1, IPC_PRIVATE, PAGE_SIZE, 0o600).unwrap() as i32;
        let space = AddrSpace::build_user();
        assert_eq!(
            shmat(&CRED, 1, &space, id, 0x2000_0000, 0).unwrap_err(),
            SysError::EINVAL
        );
        assert_eq!(
            shmget(&CRED, 1, IPC_PRIVATE, 0, 0o600).unwrap_err(),
            SysError::EINVAL
        );
    }

    #[test]
    fn faults_past_the_segment_overflow() {
        let id = shmget(&CRED, 1, IPC_PRIVATE, PAGE_SIZE, 0o600).unwrap() as i32;
        assert!(zone_fault(id, 0).is_ok());
        assert_eq!(zone_fault(id, PAGE_SIZE).unwrap_err(), SysError::EOVERFLOW);
    }
}
