//! User-visible System V IPC types: permission records, the `*_ds` status
//! structures copied out by the `IPC_STAT` commands, flags, and command
//! numbers. Bit values follow the historical encoding and must not change.

use bitflags::bitflags;

/// Key of a private IPC object; `get` with this key always allocates.
pub const IPC_PRIVATE: i32 = 0;

/// `ctl` command: copy the status structure out.
pub const IPC_STAT: i32 = 1;
/// `ctl` command: update owner and mode.
pub const IPC_SET: i32 = 2;
/// `ctl` command: mark the object removed.
pub const IPC_RMID: i32 = 3;

/// `semctl` command: read one semaphore value.
pub const GETVAL: i32 = 10;
/// `semctl` command: set one semaphore value.
pub const SETVAL: i32 = 11;
/// `semctl` command: read the pid of the last operation on one semaphore.
pub const GETPID: i32 = 12;
/// `semctl` command: read the non-zero-waiter count of one semaphore.
pub const GETNCNT: i32 = 13;
/// `semctl` command: read the zero-waiter count of one semaphore.
pub const GETZCNT: i32 = 14;
/// `semctl` command: read every semaphore value.
pub const GETALL: i32 = 15;
/// `semctl` command: set every semaphore value.
pub const SETALL: i32 = 16;

/// Caller credentials consulted by the IPC permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    pub euid: u32,
    pub egid: u32,
}

impl Cred {
    /// Root credentials, which bypass every permission check.
    pub const ROOT: Cred = Cred { euid: 0, egid: 0 };
}

/// Ownership and permissions of an IPC object.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IpcPerm {
    pub key: i32,
    pub uid: u32,
    pub gid: u32,
    pub cuid: u32,
    pub cgid: u32,
    pub mode: u16,
    pub seq: u16,
}

/// Status of a shared memory segment (`shmctl(IPC_STAT)`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ShmidDs {
    pub shm_perm: IpcPerm,
    /// Size of segment in bytes, always a page multiple here.
    pub shm_segsz: usize,
    /// Last attach time.
    pub shm_atime: u64,
    /// Last detach time.
    pub shm_dtime: u64,
    /// Creation time, or time of the last `shmctl` change.
    pub shm_ctime: u64,
    /// Pid of the creator.
    pub shm_cpid: usize,
    /// Pid of the last `shmat`/`shmdt`.
    pub shm_lpid: usize,
    /// Number of current attaches.
    pub shm_nattch: usize,
}

/// Status of a semaphore set (`semctl(IPC_STAT)`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SemidDs {
    pub sem_perm: IpcPerm,
    /// Time of the last `semop`.
    pub sem_otime: u64,
    /// Creation time, or time of the last `semctl` change.
    pub sem_ctime: u64,
    /// Number of semaphores in the set.
    pub sem_nsems: usize,
}

/// Status of a message queue (`msgctl(IPC_STAT)`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgidDs {
    pub msg_perm: IpcPerm,
    /// Time of the last `msgsnd`.
    pub msg_stime: u64,
    /// Time of the last `msgrcv`.
    pub msg_rtime: u64,
    /// Creation time, or time of the last `msgctl` change.
    pub msg_ctime: u64,
    /// Bytes currently queued.
    pub msg_cbytes: usize,
    /// Messages currently queued.
    pub msg_qnum: usize,
    /// Byte budget of the queue.
    pub msg_qbytes: usize,
    /// Pid of the last sender.
    pub msg_lspid: usize,
    /// Pid of the last receiver.
    pub msg_lrpid: usize,
}

/// One operation of a `semop`/`semtimedop` transaction.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Sembuf {
    pub sem_num: u16,
    pub sem_op: i16,
    pub sem_flg: i16,
}

/// Timeout argument of `semtimedop`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl Timespec {
    /// Converts to whole milliseconds, saturating.
    pub fn as_ms(&self) -> u64 {
        let secs = self.tv_sec.max(0) as u64;
        let nsec = self.tv_nsec.max(0) as u64;
        secs.saturating_mul(1000).saturating_add(nsec / 1_000_000)
    }
}

bitflags! {
    /// Flags accepted by every `get` operation, alongside the low nine
    /// permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpcGetFlags: i32 {
        /// Create the object if the key is not bound.
        const IPC_CREAT = 1 << 9;
        /// With `IPC_CREAT`, fail if the key is already bound.
        const IPC_EXCL = 1 << 10;
    }
}

bitflags! {
    /// Flags accepted by `shmat`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShmAtFlags: i32 {
        /// Round a caller-supplied address down to `SHMLBA`. Accepted and
        /// inert: anchored attach is refused, so there is nothing to round.
        const SHM_RND = 1 << 12;
        /// Attach the segment for read-only access.
        const SHM_RDONLY = 1 << 13;
    }
}

bitflags! {
    /// Per-operation flags in `Sembuf::sem_flg`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SemFlags: i16 {
        /// Fail with `EAGAIN` instead of blocking.
        const IPC_NOWAIT = 1 << 11;
        /// Accepted for compatibility; undo state is not tracked.
        const SEM_UNDO = 1 << 14;
    }
}

bitflags! {
    /// Flags accepted by `msgsnd` and `msgrcv`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: i32 {
        /// Fail instead of blocking.
        const IPC_NOWAIT = 1 << 11;
        /// Truncate an oversized message instead of failing.
        const MSG_NOERROR = 1 << 15;
        /// With a positive selector, receive the first message of any other
        /// type.
        const MSG_EXCEPT = 1 << 16;
    }
}
