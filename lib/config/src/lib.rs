//! Compile-time configuration of the kernel core.

#![no_std]

pub mod elf;
pub mod ipc;
pub mod mm;
