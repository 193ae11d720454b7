//! Access to the current thread.
//!
//! The scheduler owning the CPUs is an external collaborator; it tells this
//! module how to resolve the running task. Syscall entry paths ask for the
//! current task and cannot proceed without one.

use alloc::sync::Arc;

use spin::Once;

use crate::task::Task;

static PROVIDER: Once<fn() -> Option<Arc<Task>>> = Once::new();

/// Registers the current-task resolver. Later registrations are ignored.
pub fn register_task_provider(provider: fn() -> Option<Arc<Task>>) {
    PROVIDER.call_once(|| provider);
}

/// The task running on the current CPU.
///
/// # Panics
/// Panics when no resolver is registered or no thread is running; a
/// syscall without a running thread is a kernel bug.
pub fn current_task() -> Arc<Task> {
    PROVIDER
        .get()
        .and_then(|provider| provider())
        .expect("no running thread")
}
