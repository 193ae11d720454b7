//! ELF loader policy

/// Machine the loader accepts; must match the target word size.
pub const ELF_MACHINE: u16 = elf::abi::EM_RISCV;

/// Largest `p_align` a `PT_LOAD` segment may declare.
pub const LOAD_ALIGN_MAX: u64 = 0x10000;

/// Largest mapped span a kernel module may occupy.
pub const KMOD_MAX_SIZE: usize = 128 * 1024 * 1024;

/// Longest interpreter path accepted from `PT_INTERP`.
pub const INTERP_PATH_MAX: usize = 256;
