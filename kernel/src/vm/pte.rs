//! Page table entries of the software MMU.

use alloc::sync::Arc;

use bitflags::bitflags;
use mm::frame::Frame;
use systype::memory_flags::MemProt;

bitflags! {
    /// Flags of a leaf page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        /// Valid
        const V = 1 << 0;
        /// Readable
        const R = 1 << 1;
        /// Writable
        const W = 1 << 2;
        /// Executable
        const X = 1 << 3;
        /// User-accessible
        const U = 1 << 4;
    }
}

impl From<MemProt> for PteFlags {
    fn from(prot: MemProt) -> Self {
        let mut flags = PteFlags::V | PteFlags::U;
        if prot.contains(MemProt::R) {
            flags |= PteFlags::R;
        }
        if prot.contains(MemProt::W) {
            flags |= PteFlags::W;
        }
        if prot.contains(MemProt::X) {
            flags |= PteFlags::X;
        }
        flags
    }
}

/// A leaf entry: the mapped frame and its access flags.
#[derive(Debug, Clone)]
pub struct Pte {
    frame: Arc<Frame>,
    flags: PteFlags,
}

impl Pte {
    pub fn new(frame: Arc<Frame>, flags: PteFlags) -> Self {
        Self { frame, flags }
    }

    pub fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }

    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: PteFlags) {
        self.flags = flags;
    }

    pub fn set_frame(&mut self, frame: Arc<Frame>) {
        self.frame = frame;
    }
}
