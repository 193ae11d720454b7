//! Machine relocation numbers.
//!
//! Each supported machine maps its numeric relocation types onto the small
//! set of generic kinds the loader applies. Anything outside the map makes
//! the binary non-executable.

/// The relocation semantics the loader implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// No operation.
    None,
    /// 32-bit absolute: `base + sym + addend`.
    Abs32,
    /// 64-bit absolute: `base + sym + addend`.
    Abs64,
    /// PC-relative 32-bit: `sym − reladdr + addend`.
    Pc32,
    /// Data pointer slot: `base + sym`.
    GlobDat,
    /// PLT slot: `base + sym`.
    JmpSlot,
    /// Load-base relative: `base + addend`.
    Relative,
}

// riscv64
const R_RISCV_NONE: u32 = 0;
const R_RISCV_32: u32 = 1;
const R_RISCV_64: u32 = 2;
const R_RISCV_RELATIVE: u32 = 3;
const R_RISCV_JUMP_SLOT: u32 = 5;

// x86_64
const R_X86_64_NONE: u32 = 0;
const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_GLOB_DAT: u32 = 6;
const R_X86_64_JUMP_SLOT: u32 = 7;
const R_X86_64_RELATIVE: u32 = 8;

/// Maps a machine relocation number to its kind, `None` when the machine
/// or the type is not handled.
pub fn classify(machine: u16, rtype: u32) -> Option<RelocKind> {
    match machine {
        elf::abi::EM_RISCV => match rtype {
            R_RISCV_NONE => Some(RelocKind::None),
            R_RISCV_32 => Some(RelocKind::Abs32),
            R_RISCV_64 => Some(RelocKind::Abs64),
            R_RISCV_RELATIVE => Some(RelocKind::Relative),
            R_RISCV_JUMP_SLOT => Some(RelocKind::JmpSlot),
            _ => None,
        },
        elf::abi::EM_X86_64 => match rtype {
            R_X86_64_NONE => Some(RelocKind::None),
            R_X86_64_64 => Some(RelocKind::Abs64),
            R_X86_64_PC32 => Some(RelocKind::Pc32),
            R_X86_64_GLOB_DAT => Some(RelocKind::GlobDat),
            R_X86_64_JUMP_SLOT => Some(RelocKind::JmpSlot),
            R_X86_64_RELATIVE => Some(RelocKind::Relative),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn riscv_and_x86_64_maps() {
        assert_eq!(
            classify(elf::abi::EM_RISCV, R_RISCV_RELATIVE),
            Some(RelocKind::Relative)
        );
        assert_eq!(
            classify(elf::abi::EM_RISCV, R_RISCV_JUMP_SLOT),
            Some(RelocKind::JmpSlot)
        );
        assert_eq!(classify(elf::abi::EM_RISCV, 99), None);
        assert_eq!(
            classify(elf::abi::EM_X86_64, R_X86_64_GLOB_DAT),
            Some(RelocKind::GlobDat)
        );
        assert_eq!(
            classify(elf::abi::EM_X86_64, R_X86_64_PC32),
            Some(RelocKind::Pc32)
        );
        assert_eq!(classify(elf::abi::EM_AARCH64, R_X86_64_64), None);
    }
}
