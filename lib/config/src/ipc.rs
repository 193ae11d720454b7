//! System V IPC limits

use crate::mm::PAGE_SIZE;

/// Minimum shared memory segment size
pub const SHMMIN: usize = PAGE_SIZE;
/// Maximum shared memory segment size
pub const SHMMAX: usize = usize::MAX - PAGE_SIZE;
/// Maximum number of shared memory segments
pub const SHMMNI: u32 = 4096;
/// Low boundary address multiple for `shmat`
pub const SHMLBA: usize = PAGE_SIZE;

/// Maximum number of operations per `semop` call
pub const SEMOPM: usize = 256;
/// Maximum number of semaphores per set
pub const SEMMSL: usize = 256;
/// Maximum number of semaphore sets
pub const SEMMNI: u32 = 4096;
/// Maximum semaphore value
pub const SEMVMX: u16 = i16::MAX as u16;

/// Maximum number of message queues
pub const MSGMNI: u32 = 4096;
/// Maximum size of a single message
pub const MSGMAX: usize = PAGE_SIZE;
/// Default (and admin-capped) byte budget of a message queue
pub const MSGMNB: usize = PAGE_SIZE;
