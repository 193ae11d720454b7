//! Zones: the protected, page-aligned sub-regions of an address space.
//!
//! A zone carries metadata only; the frames backing it live in the page
//! table. What a fault produces depends on the zone's kind: an anonymous
//! zone hands out a zeroed frame, a file-backed zone reads the page through
//! the backing file, and a shm zone consults the segment's page cache. The
//! kinds are tagged variants rather than an operations vtable; `open` and
//! `close` are the attach bookkeeping hooks of the shm variant and no-ops
//! for the rest.

use alloc::sync::Arc;

use config::mm::PAGE_SIZE;
use mm::{address::VirtAddr, frame::Frame};
use systype::{
    memory_flags::{MapFlags, MemProt},
    SysResult,
};
use vfs::File;

use crate::ipc::shm;

/// Backing of a zone.
#[derive(Clone)]
pub enum ZoneKind {
    /// Zero-filled on first touch.
    Anonymous,
    /// Read through the file at the zone's offset.
    FileBacked(Arc<dyn File>),
    /// Served from the page cache of the shm segment with this id.
    Shm(i32),
}

impl ZoneKind {
    /// Bookkeeping when a zone of this kind enters an address space (zone
    /// split siblings, address space duplication).
    pub(crate) fn open(&self) {
        if let ZoneKind::Shm(id) = self {
            shm::zone_open(*id);
        }
    }

    /// Bookkeeping when a zone of this kind leaves an address space.
    pub(crate) fn close(&self) {
        if let ZoneKind::Shm(id) = self {
            shm::zone_close(*id);
        }
    }
}

impl core::fmt::Debug for ZoneKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ZoneKind::Anonymous => f.write_str("Anonymous"),
            ZoneKind::FileBacked(_) => f.write_str("FileBacked"),
            ZoneKind::Shm(id) => write!(f, "Shm({})", id),
        }
    }
}

/// A contiguous, protected, page-aligned sub-region of an address space.
#[derive(Debug)]
pub struct Zone {
    addr: VirtAddr,
    size: usize,
    /// File offset backing the first byte of the zone.
    off: usize,
    prot: MemProt,
    flags: MapFlags,
    kind: ZoneKind,
}

/// A lightweight description of a zone, for lookups and inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneInfo {
    pub addr: VirtAddr,
    pub size: usize,
    pub prot: MemProt,
    pub flags: MapFlags,
}

impl Zone {
    pub(crate) fn new(
        addr: VirtAddr,
        size: usize,
        off: usize,
        prot: MemProt,
        flags: MapFlags,
        kind: ZoneKind,
    ) -> Self {
        debug_assert!(addr.page_offset() == 0 && size % PAGE_SIZE == 0 && size > 0);
        Self {
            addr,
            size,
            off,
            prot,
            flags,
            kind,
        }
    }

    /// Clones the zone's metadata over a (sub-)range; the backing kind is
    /// shared.
    pub(crate) fn dup_range(&self, addr: VirtAddr, size: usize, off: usize) -> Zone {
        Zone {
            addr,
            size,
            off,
            prot: self.prot,
            flags: self.flags,
            kind: self.kind.clone(),
        }
    }

    pub fn addr(&self) -> VirtAddr {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn off(&self) -> usize {
        self.off
    }

    pub fn prot(&self) -> MemProt {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub(crate) fn kind(&self) -> &ZoneKind {
        &self.kind
    }

    /// One past the last byte of the zone.
    pub fn end(&self) -> VirtAddr {
        VirtAddr::new(self.addr.to_usize() + self.size)
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.addr && va < self.end()
    }

    /// Whether writes through this zone are visible to other mappings of the
    /// same object.
    pub fn is_shared(&self) -> bool {
        self.flags.contains(MapFlags::SHARED)
    }

    pub(crate) fn set_addr(&mut self, addr: VirtAddr) {
        self.addr = addr;
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub(crate) fn set_off(&mut self, off: usize) {
        self.off = off;
    }

    pub(crate) fn set_prot(&mut self, prot: MemProt) {
        self.prot = prot;
    }

    pub fn info(&self) -> ZoneInfo {
        ZoneInfo {
            addr: self.addr,
            size: self.size,
            prot: self.prot,
            flags: self.flags,
        }
    }

    /// Produces the frame backing the page at byte offset `page_off` from
    /// the zone base.
    ///
    /// # Errors
    /// `ENOMEM` when no frame can be allocated, `EOVERFLOW` when a shm fault
    /// lands past the segment, I/O errors from the backing file.
    pub(crate) fn fault(&self, page_off: usize) -> SysResult<Arc<Frame>> {
        debug_assert!(page_off % PAGE_SIZE == 0 && page_off < self.size);
        match &self.kind {
            ZoneKind::Anonymous => Ok(Arc::new(Frame::build()?)),
            ZoneKind::FileBacked(file) => {
                let frame = Frame::build()?;
                let mut buf = [0u8; PAGE_SIZE];
                // A short read leaves the tail zeroed, matching the
                // zero-fill-past-EOF contract of a mapping.
                let read = file.read_at(self.off + page_off, &mut buf)?;
                frame.write_at(0, &buf[..read]);
                Ok(Arc::new(frame))
            }
            ZoneKind::Shm(id) => shm::zone_fault(*id, page_off),
        }
    }
}
