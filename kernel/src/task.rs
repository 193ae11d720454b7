//! The thread context the core consumes.
//!
//! Scheduling is out of scope; a [`Task`] is just what the syscall layer
//! needs from the current thread: its pid, credentials, address space and
//! IPC accounting.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use systype::ipc::Cred;

use crate::vm::AddrSpace;

/// IPC accounting of a task.
#[derive(Debug, Default)]
pub struct TaskStats {
    pub msgsnd: AtomicU64,
    pub msgrcv: AtomicU64,
}

/// A thread of a process.
pub struct Task {
    pid: usize,
    cred: Cred,
    vm_space: Arc<AddrSpace>,
    stats: TaskStats,
}

impl Task {
    pub fn new(pid: usize, cred: Cred, vm_space: Arc<AddrSpace>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            cred,
            vm_space,
            stats: TaskStats::default(),
        })
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn cred(&self) -> &Cred {
        &self.cred
    }

    pub fn addr_space(&self) -> &Arc<AddrSpace> {
        &self.vm_space
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    pub fn count_msgsnd(&self) {
        self.stats.msgsnd.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_msgrcv(&self) {
        self.stats.msgrcv.fetch_add(1, Ordering::Relaxed);
    }
}
