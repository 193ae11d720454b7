//! The process-execution substrate: per-process virtual memory, the ELF
//! dynamic-binary loader, and System V IPC, over an abstract MMU and
//! filesystem.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod elf;
pub mod ipc;
pub mod ksym;
pub mod logging;
pub mod processor;
pub mod syscall;
pub mod sysfs;
pub mod task;
pub mod vm;

/// Wires up the subsystems that need explicit initialization: the logger and
/// the introspection nodes. Callable before any thread exists.
pub fn init() {
    logger::init();
    sysfs::init();
}
