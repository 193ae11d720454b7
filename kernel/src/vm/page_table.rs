//! The software page table behind the abstract MMU.
//!
//! The core is specified against an abstract MMU; this module is its one
//! implementation. A [`PageTable`] maps virtual page numbers to [`Pte`]s,
//! where an entry owns an `Arc<Frame>`; the frame reference count is the
//! `Arc` strong count across page tables and the shm page caches.
//!
//! Copy-on-write works the way the hardware variant would: cloning an
//! address space strips the write bit from private writable entries on both
//! sides, and the write-fault path either regains the bit (frame no longer
//! shared) or copies the page first.

use alloc::{sync::Arc, vec::Vec};
use core::ops::Bound;

use mm::{address::VirtPageNum, frame::Frame};
use mutex::SpinLock;
use systype::{memory_flags::MemProt, SysError, SysResult};

use alloc::collections::BTreeMap;

use super::pte::{Pte, PteFlags};

/// The MMU operations the memory subsystems consume.
pub trait Mmu {
    /// Installs a mapping for one page.
    fn map(&self, vpn: VirtPageNum, frame: Arc<Frame>, flags: PteFlags) -> SysResult<()>;
    /// Removes the mappings of `pages` pages starting at `start`.
    fn unmap(&self, start: VirtPageNum, pages: usize);
    /// Rewrites the access bits of the mapped pages in the range.
    ///
    /// `shared` tells the MMU whether the range maps a shared object; write
    /// permission on a shared mapping is installed directly, while on a
    /// private mapping it is withheld whenever the frame is still shared so
    /// the next write faults into the copy-on-write path.
    fn protect(&self, start: VirtPageNum, pages: usize, prot: MemProt, shared: bool);
}

/// A data structure for manipulating mappings from virtual page numbers to
/// frames.
#[derive(Debug)]
pub struct PageTable {
    entries: SpinLock<BTreeMap<VirtPageNum, Pte>>,
}

impl PageTable {
    /// Creates an empty page table.
    pub fn new() -> Self {
        Self {
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Looks up the entry mapping `vpn`.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<Pte> {
        self.entries.lock().get(&vpn).cloned()
    }

    /// Grants write access to the page at `vpn`, copying the frame first
    /// when a private mapping still shares it.
    ///
    /// # Errors
    /// Returns `EFAULT` if the page is not mapped, `ENOMEM` if the copy
    /// cannot be allocated.
    pub fn make_writable(&self, vpn: VirtPageNum, shared: bool) -> SysResult<()> {
        let mut entries = self.entries.lock();
        let pte = entries.get_mut(&vpn).ok_or(SysError::EFAULT)?;
        if !shared && Arc::strong_count(pte.frame()) > 1 {
            let copy = Frame::build()?;
            copy.copy_from(pte.frame());
            pte.set_frame(Arc::new(copy));
        }
        pte.set_flags(pte.flags() | PteFlags::W);
        Ok(())
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }

    /// Clones the mapped entries of `[start, start + pages)` into `dst`.
    ///
    /// With `cow`, writable entries lose their write bit on both sides and
    /// keep sharing the frame; without it (shared objects), entries are
    /// copied verbatim.
    pub fn clone_range_cow(&self, dst: &PageTable, start: VirtPageNum, pages: usize, cow: bool) {
        let end = VirtPageNum::new(start.to_usize() + pages);
        let mut src = self.entries.lock();
        let mut dst_entries = dst.entries.lock();
        let vpns: Vec<VirtPageNum> = src
            .range((Bound::Included(start), Bound::Excluded(end)))
            .map(|(&vpn, _)| vpn)
            .collect();
        for vpn in vpns {
            let pte = src.get_mut(&vpn).unwrap();
            if cow && pte.flags().contains(PteFlags::W) {
                pte.set_flags(pte.flags() - PteFlags::W);
            }
            dst_entries.insert(vpn, pte.clone());
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu for PageTable {
    fn map(&self, vpn: VirtPageNum, frame: Arc<Frame>, flags: PteFlags) -> SysResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&vpn) {
            return Err(SysError::EEXIST);
        }
        entries.insert(vpn, Pte::new(frame, flags));
        Ok(())
    }

    fn unmap(&self, start: VirtPageNum, pages: usize) {
        let end = VirtPageNum::new(start.to_usize() + pages);
        let mut entries = self.entries.lock();
        let vpns: Vec<VirtPageNum> = entries
            .range((Bound::Included(start), Bound::Excluded(end)))
            .map(|(&vpn, _)| vpn)
            .collect();
        for vpn in vpns {
            entries.remove(&vpn);
        }
    }

    fn protect(&self, start: VirtPageNum, pages: usize, prot: MemProt, shared: bool) {
        let end = VirtPageNum::new(start.to_usize() + pages);
        let mut entries = self.entries.lock();
        let vpns: Vec<VirtPageNum> = entries
            .range((Bound::Included(start), Bound::Excluded(end)))
            .map(|(&vpn, _)| vpn)
            .collect();
        for vpn in vpns {
            let pte = entries.get_mut(&vpn).unwrap();
            let mut flags = PteFlags::from(prot);
            if flags.contains(PteFlags::W)
                && !shared
                && Arc::strong_count(pte.frame()) > 1
            {
                // Keep the entry write-protected; the write fault performs
                // the copy.
                flags -= PteFlags::W;
            }
            pte.set_flags(flags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpn(n: usize) -> VirtPageNum {
        VirtPageNum::new(n)
    }

    #[test]
    fn map_refuses_double_mapping() {
        let pt = PageTable::new();
        let frame = Arc::new(Frame::build().unwrap());
        pt.map(vpn(7), Arc::clone(&frame), PteFlags::V | PteFlags::R)
            .unwrap();
        let err = pt
            .map(vpn(7), frame, PteFlags::V | PteFlags::R)
            .unwrap_err();
        assert_eq!(err, SysError::EEXIST);
    }

    #[test]
    fn cow_clone_strips_write_on_both_sides() {
        let src = PageTable::new();
        let dst = PageTable::new();
        let frame = Arc::new(Frame::build().unwrap());
        src.map(vpn(1), frame, PteFlags::from(MemProt::RW)).unwrap();
        src.clone_range_cow(&dst, vpn(0), 16, true);
        assert!(!src.translate(vpn(1)).unwrap().flags().contains(PteFlags::W));
        assert!(!dst.translate(vpn(1)).unwrap().flags().contains(PteFlags::W));

        // Breaking COW on one side copies the frame and restores W.
        dst.make_writable(vpn(1), false).unwrap();
        let src_pte = src.translate(vpn(1)).unwrap();
        let dst_pte = dst.translate(vpn(1)).unwrap();
        assert!(!Arc::ptr_eq(src_pte.frame(), dst_pte.frame()));
        assert!(dst_pte.flags().contains(PteFlags::W));
    }

    #[test]
    fn shared_clone_keeps_write_access() {
        let src = PageTable::new();
        let dst = PageTable::new();
        let frame = Arc::new(Frame::build().unwrap());
        src.map(vpn(2), frame, PteFlags::from(MemProt::RW)).unwrap();
        src.clone_range_cow(&dst, vpn(0), 16, false);
        assert!(src.translate(vpn(2)).unwrap().flags().contains(PteFlags::W));
        assert!(dst.translate(vpn(2)).unwrap().flags().contains(PteFlags::W));
        assert!(Arc::ptr_eq(
            src.translate(vpn(2)).unwrap().frame(),
            dst.translate(vpn(2)).unwrap().frame()
        ));
    }
}
