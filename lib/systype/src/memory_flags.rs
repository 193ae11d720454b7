//! Module for abstracting memory permissions.

use bitflags::bitflags;

bitflags! {
    /// Protection of a virtual memory range, or the access class of a fault.
    ///
    /// When describing a fault, exactly one bit is set.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemProt: u32 {
        /// Range can be read.
        const R = 1 << 0;
        /// Range can be written.
        const W = 1 << 1;
        /// Range can be executed.
        const X = 1 << 2;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

bitflags! {
    /// Sharing and backing of a mapped zone.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Updates are visible to every mapping of the same object.
        const SHARED = 0x01;
        /// Updates stay private to this address space (copy-on-write).
        const PRIVATE = 0x02;
        /// No file backs the zone.
        const ANONYMOUS = 0x20;
    }
}
