//! Synchronization primitives: spin mutexes and the wait queue the blocking
//! IPC operations sleep on.

#![no_std]

extern crate alloc;

mod mutex;
mod waitq;

pub use mutex::{
    new_share_mutex, MutexGuard, MutexSupport, ShareMutex, Spin, SpinLock, SpinMutex,
};
pub use waitq::WaitQueue;
