//! System V IPC namespaces.
//!
//! Each of shm, sem and msg keeps its objects in an [`IpcTable`]: an id
//! index, a key index, an insertion-ordered id list for the introspection
//! streams, a live count bounded by the namespace limit, and the sequence
//! the id allocator hashes from. Ids come from iterating an integer hash,
//! which makes them look unpredictable without a per-id allocation
//! structure.
//!
//! The namespace lock is held only to locate an object and adjust its
//! in-flight reference count, never across the per-object lock. An object
//! marked removed survives while references or attaches remain and is
//! dropped from the indexes at the first release that finds it idle.

use alloc::{sync::Arc, vec::Vec};
use core::ops::Deref;

use hashbrown::HashMap;
use mutex::SpinLock;
use systype::{
    ipc::{Cred, IpcGetFlags, IpcPerm, IPC_PRIVATE},
    SysError, SysResult,
};

pub mod msg;
pub mod sem;
pub mod shm;

/// Common surface of a registered IPC object.
pub(crate) trait IpcObject: Send + Sync {
    fn id(&self) -> i32;
    fn key(&self) -> i32;
    /// Whether the object has been marked removed.
    fn removed(&self) -> bool;
    /// Whether a removed object may be freed now (shm also waits for its
    /// attach count to reach zero).
    fn removal_ready(&self) -> bool {
        true
    }
    /// Permission probe used by the shared `get` path.
    fn hasperm(&self, cred: &Cred, req: u16) -> SysResult<()>;
}

/// The id hash: two multiply-xorshift rounds, masked positive.
fn ipc_hash(x: u32) -> u32 {
    let x = ((x >> 16) ^ x).wrapping_mul(0x45D9F3B);
    let x = ((x >> 16) ^ x).wrapping_mul(0x45D9F3B);
    ((x >> 16) ^ x) & 0x7FFF_FFFF
}

#[derive(Debug)]
struct Entry<T> {
    obj: Arc<T>,
    /// In-flight references handed out by `acquire*`; guarded by the table
    /// lock.
    refs: u32,
}

#[derive(Debug)]
struct TableInner<T> {
    by_id: HashMap<i32, Entry<T>>,
    by_key: HashMap<i32, i32>,
    /// Ids in insertion order, for the introspection streams.
    order: Vec<i32>,
    seq: u16,
    count: u32,
}

/// One namespace's registry.
#[derive(Debug)]
pub(crate) struct IpcTable<T: IpcObject> {
    limit: u32,
    inner: SpinLock<TableInner<T>>,
}

/// A counted reference to a registered object; releasing it may free an
/// object that was removed while referenced.
#[derive(Debug)]
pub(crate) struct IpcRef<'a, T: IpcObject> {
    table: &'a IpcTable<T>,
    obj: Arc<T>,
}

impl<T: IpcObject> Deref for IpcRef<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.obj
    }
}

impl<T: IpcObject> Drop for IpcRef<'_, T> {
    fn drop(&mut self) {
        self.table.release(self.obj.id());
    }
}

impl<T: IpcObject> IpcTable<T> {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            inner: SpinLock::new(TableInner {
                by_id: HashMap::new(),
                by_key: HashMap::new(),
                order: Vec::new(),
                seq: 0,
                count: 0,
            }),
        }
    }

    /// Locates the object with `id` and takes a reference on it.
    pub fn acquire(&self, id: i32) -> Option<IpcRef<'_, T>> {
        let mut inner = self.inner.lock();
        let entry = inner.by_id.get_mut(&id)?;
        entry.refs += 1;
        Some(IpcRef {
            table: self,
            obj: Arc::clone(&entry.obj),
        })
    }

    /// Locates the object bound to `key` and takes a reference on it.
    pub fn acquire_by_key(&self, key: i32) -> Option<IpcRef<'_, T>> {
        let mut inner = self.inner.lock();
        let id = *inner.by_key.get(&key)?;
        let entry = inner.by_id.get_mut(&id)?;
        entry.refs += 1;
        Some(IpcRef {
            table: self,
            obj: Arc::clone(&entry.obj),
        })
    }

    /// Allocates an id and registers the object `build` produces for it.
    ///
    /// # Errors
    /// `ENOSPC` when the namespace is at its limit; errors of `build`.
    pub fn create(
        &self,
        key: i32,
        build: impl FnOnce(i32, u16) -> SysResult<Arc<T>>,
    ) -> SysResult<IpcRef<'_, T>> {
        let mut inner = self.inner.lock();
        if inner.count >= self.limit {
            return Err(SysError::ENOSPC);
        }
        inner.seq = inner.seq.wrapping_add(1);
        let seq = inner.seq;
        let mut candidate = seq as u32;
        let id = loop {
            candidate = ipc_hash(candidate);
            if !inner.by_id.contains_key(&(candidate as i32)) {
                break candidate as i32;
            }
        };
        let obj = build(id, seq)?;
        inner.by_id.insert(
            id,
            Entry {
                obj: Arc::clone(&obj),
                refs: 1,
            },
        );
        if key != IPC_PRIVATE {
            inner.by_key.insert(key, id);
        }
        inner.order.push(id);
        inner.count += 1;
        Ok(IpcRef { table: self, obj })
    }

    /// Drops one in-flight reference; frees the object when it is removed,
    /// idle and ready.
    fn release(&self, id: i32) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.by_id.get_mut(&id) else {
            return;
        };
        entry.refs -= 1;
        Self::free_if_idle(&mut inner, id);
    }

    /// Re-runs the removal check, used when an attach count drops without a
    /// reference being held.
    pub fn removal_check(&self, id: i32) {
        let mut inner = self.inner.lock();
        Self::free_if_idle(&mut inner, id);
    }

    /// Unbinds the key of a removed object so new `get` calls stop
    /// resolving it, while id-holders keep working until the final free.
    pub fn unbind_key(&self, id: i32) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.by_id.get(&id) else {
            return;
        };
        let key = entry.obj.key();
        if key != IPC_PRIVATE && inner.by_key.get(&key) == Some(&id) {
            inner.by_key.remove(&key);
        }
    }

    fn free_if_idle(inner: &mut TableInner<T>, id: i32) {
        let Some(entry) = inner.by_id.get(&id) else {
            return;
        };
        if entry.refs != 0 || !entry.obj.removed() || !entry.obj.removal_ready() {
            return;
        }
        let key = entry.obj.key();
        inner.by_id.remove(&id);
        // The key may already be unbound, or rebound by a younger object.
        if key != IPC_PRIVATE && inner.by_key.get(&key) == Some(&id) {
            inner.by_key.remove(&key);
        }
        inner.order.retain(|&x| x != id);
        inner.count -= 1;
    }

    /// Objects in insertion order, for the introspection streams.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).map(|e| Arc::clone(&e.obj)))
            .collect()
    }

    /// Number of live objects.
    pub fn count(&self) -> u32 {
        self.inner.lock().count
    }
}

/// Shared `get` semantics: a private key always allocates; a bound key is
/// returned after a read permission check, honoring `IPC_CREAT`/`IPC_EXCL`.
pub(crate) fn sysv_get<T: IpcObject>(
    table: &IpcTable<T>,
    key: i32,
    flags: IpcGetFlags,
    cred: &Cred,
    build: impl FnOnce(i32, u16) -> SysResult<Arc<T>>,
) -> SysResult<i32> {
    if key == IPC_PRIVATE {
        return Ok(table.create(key, build)?.id());
    }
    if let Some(obj) = table.acquire_by_key(key) {
        if flags.contains(IpcGetFlags::IPC_CREAT | IpcGetFlags::IPC_EXCL) {
            return Err(SysError::EEXIST);
        }
        obj.hasperm(cred, 0o4)?;
        return Ok(obj.id());
    }
    if !flags.contains(IpcGetFlags::IPC_CREAT) {
        return Err(SysError::ENOENT);
    }
    Ok(table.create(key, build)?.id())
}

/// UNIX permission check against an IPC object.
///
/// Root bypasses. The effective bits start from the `other` triad and pick
/// up the user and group triads when the caller's ids match.
pub(crate) fn ipc_hasperm(perm: &IpcPerm, cred: &Cred, req: u16) -> SysResult<()> {
    if cred.euid == 0 {
        return Ok(());
    }
    let mut mode = perm.mode & 0o7;
    if perm.uid == cred.euid {
        mode |= (perm.mode >> 6) & 0o7;
    }
    if perm.gid == cred.egid {
        mode |= (perm.mode >> 3) & 0o7;
    }
    if mode & req != req {
        return Err(SysError::EACCES);
    }
    Ok(())
}

/// Owner check: root, the owner, or the creator.
pub(crate) fn ipc_isowner(perm: &IpcPerm, cred: &Cred) -> SysResult<()> {
    if cred.euid != 0 && cred.euid != perm.uid && cred.euid != perm.cuid {
        return Err(SysError::EPERM);
    }
    Ok(())
}

/// Fills a new object's permission record from the creator's credentials.
pub(crate) fn new_perm(key: i32, cred: &Cred, mode: u16, seq: u16) -> IpcPerm {
    IpcPerm {
        key,
        uid: cred.euid,
        gid: cred.egid,
        cuid: cred.euid,
        cgid: cred.egid,
        mode: mode & 0o777,
        seq,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct Dummy {
        id: i32,
        key: i32,
        removed: AtomicBool,
        perm: IpcPerm,
    }

    impl IpcObject for Dummy {
        fn id(&self) -> i32 {
            self.id
        }
        fn key(&self) -> i32 {
            self.key
        }
        fn removed(&self) -> bool {
            self.removed.load(Ordering::Relaxed)
        }
        fn hasperm(&self, cred: &Cred, req: u16) -> SysResult<()> {
            ipc_hasperm(&self.perm, cred, req)
        }
    }

    fn build(key: i32, mode: u16) -> impl FnOnce(i32, u16) -> SysResult<Arc<Dummy>> {
        move |id, seq| {
            Ok(Arc::new(Dummy {
                id,
                key,
                removed: AtomicBool::new(false),
                perm: new_perm(key, &Cred { euid: 100, egid: 100 }, mode, seq),
            }))
        }
    }

    #[test]
    fn ids_are_hashed_and_distinct() {
        let table: IpcTable<Dummy> = IpcTable::new(16);
        let a = table.create(IPC_PRIVATE, build(IPC_PRIVATE, 0o600)).unwrap().id();
        let b = table.create(IPC_PRIVATE, build(IPC_PRIVATE, 0o600)).unwrap().id();
        assert_ne!(a, b);
        assert!(a >= 0 && b >= 0);
        // Consecutive ids do not look sequential.
        assert_ne!(b, a + 1);
    }

    #[test]
    fn get_semantics_cover_creat_and_excl() {
        let cred = Cred { euid: 100, egid: 100 };
        let table: IpcTable<Dummy> = IpcTable::new(16);
        assert_eq!(
            sysv_get(&table, 42, IpcGetFlags::empty(), &cred, build(42, 0o600)).unwrap_err(),
            SysError::ENOENT
        );
        let id = sysv_get(&table, 42, IpcGetFlags::IPC_CREAT, &cred, build(42, 0o600)).unwrap();
        assert_eq!(
            sysv_get(&table, 42, IpcGetFlags::IPC_CREAT, &cred, build(42, 0o600)).unwrap(),
            id
        );
        assert_eq!(
            sysv_get(
                &table,
                42,
                IpcGetFlags::IPC_CREAT | IpcGetFlags::IPC_EXCL,
                &cred,
                build(42, 0o600)
            )
            .unwrap_err(),
            SysError::EEXIST
        );
        // A stranger without read permission cannot look it up.
        let stranger = Cred { euid: 7, egid: 7 };
        assert_eq!(
            sysv_get(&table, 42, IpcGetFlags::empty(), &stranger, build(42, 0o600)).unwrap_err(),
            SysError::EACCES
        );
    }

    #[test]
    fn namespace_limit_is_enforced() {
        let table: IpcTable<Dummy> = IpcTable::new(2);
        table.create(IPC_PRIVATE, build(IPC_PRIVATE, 0o600)).unwrap();
        table.create(IPC_PRIVATE, build(IPC_PRIVATE, 0o600)).unwrap();
        assert_eq!(
            table
                .create(IPC_PRIVATE, build(IPC_PRIVATE, 0o600))
                .unwrap_err(),
            SysError::ENOSPC
        );
    }

    #[test]
    fn removed_objects_free_at_last_release() {
        let table: IpcTable<Dummy> = IpcTable::new(16);
        let id = table.create(7, build(7, 0o600)).unwrap().id();
        let held = table.acquire(id).unwrap();
        held.removed.store(true, Ordering::Relaxed);
        // Still referenced: the object survives.
        table.removal_check(id);
        assert_eq!(table.count(), 1);
        drop(held);
        assert_eq!(table.count(), 0);
        assert!(table.acquire(id).is_none());
        assert!(table.acquire_by_key(7).is_none());
    }

    #[test]
    fn permission_triads_combine() {
        let perm = IpcPerm {
            key: 0,
            uid: 100,
            gid: 200,
            cuid: 100,
            cgid: 200,
            mode: 0o640,
            seq: 1,
        };
        assert!(ipc_hasperm(&perm, &Cred::ROOT, 0o7).is_ok());
        assert!(ipc_hasperm(&perm, &Cred { euid: 100, egid: 1 }, 0o6).is_ok());
        assert!(ipc_hasperm(&perm, &Cred { euid: 1, egid: 200 }, 0o4).is_ok());
        assert_eq!(
            ipc_hasperm(&perm, &Cred { euid: 1, egid: 200 }, 0o2).unwrap_err(),
            SysError::EACCES
        );
        assert_eq!(
            ipc_hasperm(&perm, &Cred { euid: 1, egid: 1 }, 0o4).unwrap_err(),
            SysError::EACCES
        );
        assert!(ipc_isowner(&perm, &Cred { euid: 100, egid: 0 }).is_ok());
        assert_eq!(
            ipc_isowner(&perm, &Cred { euid: 5, egid: 0 }).unwrap_err(),
            SysError::EPERM
        );
    }
}
