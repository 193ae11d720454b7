//! Physical and virtual memory bookkeeping shared by the whole kernel:
//! address newtypes, the frame allocator, the virtual-region allocator, and
//! the entropy hook.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod address;
pub mod frame;
pub mod random;
pub mod vm_region;
