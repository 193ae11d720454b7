//! Wait queue paired with a mutex.
//!
//! A waiter enqueues itself while still holding the companion mutex, then
//! releases it for the duration of the sleep. Wakers mutate the guarded state
//! and broadcast (or signal) while holding that same mutex, so a wakeup can
//! never slip between the release and the enqueue. A wake carries a verdict:
//! `Ok` for a condition change worth re-checking, or an error such as `EIDRM`
//! when the object the waiter slept on is going away.

use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicI32, Ordering};

use systype::{SysError, SysResult};

use crate::{MutexGuard, MutexSupport, SpinLock};

struct WaitEntry {
    /// 0 while waiting, 1 on a plain wake, the negated errno on an error
    /// wake.
    state: AtomicI32,
}

/// A queue of suspended threads supporting broadcast, single wakeups, error
/// wakeups, and timed waits.
pub struct WaitQueue {
    waiters: SpinLock<VecDeque<Arc<WaitEntry>>>,
}

fn encode(res: SysResult<()>) -> i32 {
    match res {
        Ok(()) => 1,
        Err(e) => -e.code(),
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Releases `guard`, sleeps until woken or until `deadline_ms` on the
    /// monotonic clock, then reacquires the mutex.
    ///
    /// Returns the fresh guard together with the wake verdict: `Ok(())` after
    /// a plain wake, the waker's error after an error wake, or
    /// [`SysError::ETIMEDOUT`] when the deadline passed first.
    pub fn wait_locked<'a, T: ?Sized, S: MutexSupport>(
        &self,
        guard: MutexGuard<'a, T, S>,
        deadline_ms: Option<u64>,
    ) -> (MutexGuard<'a, T, S>, SysResult<()>) {
        let entry = Arc::new(WaitEntry {
            state: AtomicI32::new(0),
        });
        self.waiters.lock().push_back(Arc::clone(&entry));
        let mutex = guard.mutex;
        drop(guard);

        let res = loop {
            match entry.state.load(Ordering::Acquire) {
                0 => {}
                s if s > 0 => break Ok(()),
                s => break Err(SysError::from_repr(-s).unwrap_or(SysError::EINTR)),
            }
            if let Some(deadline) = deadline_ms {
                if timer::now_ms() >= deadline {
                    if self.try_abandon(&entry) {
                        break Err(SysError::ETIMEDOUT);
                    }
                    // A waker dequeued this entry first; take its verdict.
                    continue;
                }
            }
            core::hint::spin_loop();
        };
        (mutex.lock(), res)
    }

    /// Removes `entry` from the queue. Returns false if a waker got to it
    /// first, in which case the wake verdict is already on its way.
    fn try_abandon(&self, entry: &Arc<WaitEntry>) -> bool {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|e| Arc::ptr_eq(e, entry)) {
            waiters.remove(pos);
            true
        } else {
            false
        }
    }

    /// Wakes every waiter with the given verdict.
    pub fn broadcast(&self, res: SysResult<()>) {
        let verdict = encode(res);
        let mut waiters = self.waiters.lock();
        while let Some(entry) = waiters.pop_front() {
            entry.state.store(verdict, Ordering::Release);
        }
    }

    /// Wakes the longest-waiting thread, if any, with the given verdict.
    pub fn signal(&self, res: SysResult<()>) {
        let verdict = encode(res);
        if let Some(entry) = self.waiters.lock().pop_front() {
            entry.state.store(verdict, Ordering::Release);
        }
    }

    /// Number of threads currently enqueued.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
