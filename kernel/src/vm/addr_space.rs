//! Module for managing virtual address spaces.
//!
//! An address space is the user part of a process's virtual memory. It owns
//! a [`VirtRegion`] spanning the user address range (optionally shifted at
//! both ends by ASLR), an ordered sequence of [`Zone`]s, the shm bindings
//! recorded by `shmat`, and the software page table that maps faulted pages
//! to frames.
//!
//! Mutation is serialized by one internal lock. The effects a zone has on
//! the object backing it (a shm segment's attach count) are applied after
//! that lock is released, so the lock order between IPC objects and address
//! spaces stays one-directional: object first, space second.
//!
//! Demand paging: a fault is resolved by locating the zone, checking the
//! access class against the zone's protection, and either installing a frame
//! produced by the zone's kind or breaking copy-on-write on the already
//! mapped page.

use alloc::{sync::Arc, vec::Vec};

use alloc::collections::BTreeMap;

use config::mm::{ASLR_MASK, PAGE_MASK, PAGE_SIZE, USER_BASE, USER_TOP};
use mm::{address::VirtAddr, random::random_get, vm_region::VirtRegion};
use mutex::SpinLock;
use systype::{
    memory_flags::{MapFlags, MemProt},
    SysError, SysResult,
};
use vfs::File;

use super::{
    page_table::{Mmu, PageTable},
    vm_area::{Zone, ZoneInfo, ZoneKind},
};

/// Records that a shm segment is attached at an address of this space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmBinding {
    pub addr: VirtAddr,
    pub size: usize,
    pub shm_id: i32,
}

/// A virtual address space.
///
/// See the module-level documentation for more information.
#[derive(Debug)]
pub struct AddrSpace {
    /// Page table of the address space.
    page_table: PageTable,
    /// Region, zones and shm bindings, guarded together.
    inner: SpinLock<AddrSpaceInner>,
}

#[derive(Debug)]
struct AddrSpaceInner {
    region: VirtRegion,
    zones: BTreeMap<VirtAddr, Zone>,
    shms: Vec<ShmBinding>,
}

fn is_range_aligned(addr: usize, size: usize) -> bool {
    addr & PAGE_MASK == 0 && size & PAGE_MASK == 0
}

impl AddrSpace {
    /// Creates an empty user address space.
    ///
    /// When an entropy source is registered, the user region is shrunk at
    /// its low and high bounds by two page-aligned random deltas.
    pub fn build_user() -> Arc<Self> {
        let mut base = USER_BASE;
        let mut size = USER_TOP - USER_BASE;
        let mut rnd = [0u8; 16];
        if random_get(&mut rnd) == rnd.len() {
            let mut word = [0u8; 8];
            word.copy_from_slice(&rnd[..8]);
            let lo = usize::from_le_bytes(word) & ASLR_MASK;
            word.copy_from_slice(&rnd[8..]);
            let hi = usize::from_le_bytes(word) & ASLR_MASK;
            base += lo;
            size -= lo + hi;
        }
        Arc::new(Self {
            page_table: PageTable::new(),
            inner: SpinLock::new(AddrSpaceInner {
                region: VirtRegion::new(base, size),
                zones: BTreeMap::new(),
                shms: Vec::new(),
            }),
        })
    }

    /// Bounds of the user region, `(base, top)`.
    pub fn user_range(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.region.base(), inner.region.top())
    }

    /// Reserves virtual space and creates a zone over it. No physical pages
    /// are committed.
    ///
    /// With an anchor the zone lands exactly there or the call fails; without
    /// one the region allocator picks a fit. A backing file makes the zone
    /// file-backed at offset `off`; otherwise it is anonymous.
    ///
    /// # Errors
    /// `EINVAL` for misaligned inputs, `ENOMEM` when no virtual space is
    /// available.
    pub fn alloc(
        &self,
        anchor: Option<VirtAddr>,
        off: usize,
        size: usize,
        prot: MemProt,
        flags: MapFlags,
        file: Option<Arc<dyn File>>,
    ) -> SysResult<VirtAddr> {
        let kind = match file {
            Some(file) => ZoneKind::FileBacked(file),
            None => ZoneKind::Anonymous,
        };
        self.alloc_kind(anchor, off, size, prot, flags, kind)
    }

    pub(crate) fn alloc_kind(
        &self,
        anchor: Option<VirtAddr>,
        off: usize,
        size: usize,
        prot: MemProt,
        flags: MapFlags,
        kind: ZoneKind,
    ) -> SysResult<VirtAddr> {
        if !is_range_aligned(anchor.map_or(0, VirtAddr::to_usize), size) {
            return Err(SysError::EINVAL);
        }
        let mut inner = self.inner.lock();
        let addr = inner
            .region
            .alloc(anchor.map(VirtAddr::to_usize), size)?;
        let addr = VirtAddr::new(addr);
        inner
            .zones
            .insert(addr, Zone::new(addr, size, off, prot, flags, kind));
        Ok(addr)
    }

    /// Attaches shm segment `id` as a zone plus binding. Returns the mapped
    /// address.
    pub(crate) fn map_shm(&self, id: i32, size: usize, prot: MemProt) -> SysResult<VirtAddr> {
        let mut inner = self.inner.lock();
        let addr = inner.region.alloc(None, size)?;
        let addr = VirtAddr::new(addr);
        inner.zones.insert(
            addr,
            Zone::new(addr, size, 0, prot, MapFlags::SHARED, ZoneKind::Shm(id)),
        );
        inner.shms.push(ShmBinding {
            addr,
            size,
            shm_id: id,
        });
        Ok(addr)
    }

    /// Looks up the shm binding at `addr`.
    pub(crate) fn shm_binding_at(&self, addr: VirtAddr) -> Option<ShmBinding> {
        self.inner
            .lock()
            .shms
            .iter()
            .find(|b| b.addr == addr)
            .copied()
    }

    /// Removes the shm binding at `addr`, returning it.
    pub(crate) fn remove_shm_binding(&self, addr: VirtAddr) -> Option<ShmBinding> {
        let mut inner = self.inner.lock();
        let pos = inner.shms.iter().position(|b| b.addr == addr)?;
        Some(inner.shms.swap_remove(pos))
    }

    /// Collects the keys of the zones intersecting `[addr, end)`; assumes
    /// the inner lock is held by the caller through `inner`.
    fn affected_keys(inner: &AddrSpaceInner, addr: VirtAddr, end: VirtAddr) -> Vec<VirtAddr> {
        let mut keys: Vec<VirtAddr> = inner.zones.range(addr..end).map(|(&k, _)| k).collect();
        if let Some((&k, zone)) = inner.zones.range(..addr).next_back() {
            if zone.end() > addr {
                keys.insert(0, k);
            }
        }
        keys
    }

    /// Removes the mappings in `[addr, addr + size)`.
    ///
    /// A zone covered entirely is removed; one covered partially is
    /// truncated at its head or tail, or split around the hole. The freed
    /// pieces return to the region allocator and their pages are unmapped.
    /// The whole request is validated before the first destructive step.
    ///
    /// # Errors
    /// `EINVAL` for misaligned input, `EOVERFLOW` when `addr + size`
    /// overflows.
    pub fn free(&self, addr: VirtAddr, size: usize) -> SysResult<()> {
        if !is_range_aligned(addr.to_usize(), size) {
            return Err(SysError::EINVAL);
        }
        let end = addr
            .to_usize()
            .checked_add(size)
            .ok_or(SysError::EOVERFLOW)?;
        let end = VirtAddr::new(end);

        let mut closed: Vec<Zone> = Vec::new();
        let mut opened: Vec<ZoneKind> = Vec::new();
        let mut inner = self.inner.lock();
        for key in Self::affected_keys(&inner, addr, end) {
            let mut zone = inner.zones.remove(&key).unwrap();
            let zstart = zone.addr();
            let zend = zone.end();
            if addr <= zstart && end >= zend {
                // remove full
                inner
                    .region
                    .free(zstart.to_usize(), zone.size())
                    .expect("zone range must be reserved");
                self.page_table
                    .unmap(zstart.page_number(), zone.size() / PAGE_SIZE);
                closed.push(zone);
            } else if addr <= zstart {
                // truncate head
                let delta = end.to_usize() - zstart.to_usize();
                inner
                    .region
                    .free(zstart.to_usize(), delta)
                    .expect("zone range must be reserved");
                self.page_table
                    .unmap(zstart.page_number(), delta / PAGE_SIZE);
                zone.set_addr(end);
                zone.set_off(zone.off() + delta);
                zone.set_size(zone.size() - delta);
                inner.zones.insert(zone.addr(), zone);
            } else if end >= zend {
                // truncate tail
                let delta = zend.to_usize() - addr.to_usize();
                inner
                    .region
                    .free(addr.to_usize(), delta)
                    .expect("zone range must be reserved");
                self.page_table.unmap(addr.page_number(), delta / PAGE_SIZE);
                zone.set_size(zone.size() - delta);
                inner.zones.insert(zone.addr(), zone);
            } else {
                // split around the hole
                let sibling = zone.dup_range(
                    end,
                    zend.to_usize() - end.to_usize(),
                    zone.off() + (end.to_usize() - zstart.to_usize()),
                );
                opened.push(sibling.kind().clone());
                let hole = end.to_usize() - addr.to_usize();
                inner
                    .region
                    .free(addr.to_usize(), hole)
                    .expect("zone range must be reserved");
                self.page_table.unmap(addr.page_number(), hole / PAGE_SIZE);
                zone.set_size(addr.to_usize() - zstart.to_usize());
                inner.zones.insert(zone.addr(), zone);
                inner.zones.insert(sibling.addr(), sibling);
            }
        }
        drop(inner);

        for kind in opened {
            kind.open();
        }
        for zone in closed {
            zone.kind().close();
        }
        Ok(())
    }

    /// Changes the protection of `[addr, addr + size)`.
    ///
    /// Zones fully inside the range change in place; partially covered zones
    /// are split so exactly the requested range carries the new protection.
    /// Installed page table entries are rewritten accordingly.
    ///
    /// # Errors
    /// `EINVAL` for misaligned input, `EOVERFLOW` when `addr + size`
    /// overflows.
    pub fn protect(&self, addr: VirtAddr, size: usize, prot: MemProt) -> SysResult<()> {
        if !is_range_aligned(addr.to_usize(), size) {
            return Err(SysError::EINVAL);
        }
        let end = addr
            .to_usize()
            .checked_add(size)
            .ok_or(SysError::EOVERFLOW)?;
        let end = VirtAddr::new(end);

        let mut opened: Vec<ZoneKind> = Vec::new();
        let mut inner = self.inner.lock();
        for key in Self::affected_keys(&inner, addr, end) {
            let mut zone = inner.zones.remove(&key).unwrap();
            if zone.prot() == prot {
                inner.zones.insert(zone.addr(), zone);
                continue;
            }
            let zstart = zone.addr();
            let zend = zone.end();
            let shared = zone.is_shared();
            if addr <= zstart && end >= zend {
                // protect full
                zone.set_prot(prot);
                self.page_table.protect(
                    zstart.page_number(),
                    zone.size() / PAGE_SIZE,
                    prot,
                    shared,
                );
                inner.zones.insert(zone.addr(), zone);
            } else if addr <= zstart {
                // protect head, sibling keeps the old protection
                let delta = end.to_usize() - zstart.to_usize();
                let sibling =
                    zone.dup_range(end, zone.size() - delta, zone.off() + delta);
                opened.push(sibling.kind().clone());
                zone.set_size(delta);
                zone.set_prot(prot);
                self.page_table
                    .protect(zstart.page_number(), delta / PAGE_SIZE, prot, shared);
                inner.zones.insert(zone.addr(), zone);
                inner.zones.insert(sibling.addr(), sibling);
            } else if end >= zend {
                // protect tail via a sibling carrying the new protection
                let delta = zend.to_usize() - addr.to_usize();
                let mut sibling = zone.dup_range(
                    addr,
                    delta,
                    zone.off() + (addr.to_usize() - zstart.to_usize()),
                );
                sibling.set_prot(prot);
                opened.push(sibling.kind().clone());
                zone.set_size(zone.size() - delta);
                self.page_table
                    .protect(addr.page_number(), delta / PAGE_SIZE, prot, shared);
                inner.zones.insert(zone.addr(), zone);
                inner.zones.insert(sibling.addr(), sibling);
            } else {
                // split; the middle takes the new protection
                let low = zone.dup_range(zstart, addr.to_usize() - zstart.to_usize(), zone.off());
                let high = zone.dup_range(
                    end,
                    zend.to_usize() - end.to_usize(),
                    zone.off() + (end.to_usize() - zstart.to_usize()),
                );
                opened.push(low.kind().clone());
                opened.push(high.kind().clone());
                zone.set_off(zone.off() + (addr.to_usize() - zstart.to_usize()));
                zone.set_addr(addr);
                zone.set_size(end.to_usize() - addr.to_usize());
                zone.set_prot(prot);
                self.page_table.protect(
                    addr.page_number(),
                    (end.to_usize() - addr.to_usize()) / PAGE_SIZE,
                    prot,
                    shared,
                );
                inner.zones.insert(low.addr(), low);
                inner.zones.insert(zone.addr(), zone);
                inner.zones.insert(high.addr(), high);
            }
        }
        drop(inner);

        for kind in opened {
            kind.open();
        }
        Ok(())
    }

    /// Looks up the zone containing `addr`.
    ///
    /// # Errors
    /// `EFAULT` when no zone contains the address.
    pub fn find(&self, addr: VirtAddr) -> SysResult<ZoneInfo> {
        let inner = self.inner.lock();
        inner
            .zones
            .range(..=addr)
            .next_back()
            .map(|(_, zone)| zone)
            .filter(|zone| zone.contains(addr))
            .map(Zone::info)
            .ok_or(SysError::EFAULT)
    }

    /// Handles a page fault at `addr` with access class `access`.
    ///
    /// The address is aligned down to its page. An address outside the user
    /// region or outside every zone, or an access the zone's protection does
    /// not admit, faults with `EFAULT`. Otherwise the page is populated from
    /// the zone's backing (or copy-on-write is broken on a write).
    pub fn handle_page_fault(&self, addr: VirtAddr, access: MemProt) -> SysResult<()> {
        let addr = addr.round_down();
        let inner = self.inner.lock();
        if addr.to_usize() < inner.region.base() || addr.to_usize() >= inner.region.top() {
            log::trace!(
                "page fault outside the user region: {:#x}",
                addr.to_usize()
            );
            return Err(SysError::EFAULT);
        }
        let zone = inner
            .zones
            .range(..=addr)
            .next_back()
            .map(|(_, zone)| zone)
            .filter(|zone| zone.contains(addr))
            .ok_or(SysError::EFAULT)?;
        if !zone.prot().contains(access) {
            log::trace!(
                "access {:?} not allowed at {:#x}, protection is {:?}",
                access,
                addr.to_usize(),
                zone.prot()
            );
            return Err(SysError::EFAULT);
        }
        let vpn = addr.page_number();
        match self.page_table.translate(vpn) {
            Some(pte) => {
                if access.contains(MemProt::W) && !pte.flags().contains(super::pte::PteFlags::W) {
                    self.page_table.make_writable(vpn, zone.is_shared())?;
                }
                // Otherwise the page was mapped by a racing thread; nothing
                // to do beyond the TLB flush a hardware MMU would issue.
                Ok(())
            }
            None => {
                let page_off = addr.to_usize() - zone.addr().to_usize();
                let frame = zone.fault(page_off)?;
                self.page_table.map(vpn, frame, zone.prot().into())
            }
        }
    }

    /// Faults in every page of `[addr, addr + size)` for read access.
    pub fn populate_range(&self, addr: VirtAddr, size: usize) -> SysResult<()> {
        if !is_range_aligned(addr.to_usize(), size) {
            return Err(SysError::EINVAL);
        }
        let mut off = 0;
        while off < size {
            self.handle_page_fault(VirtAddr::new(addr.to_usize() + off), MemProt::R)?;
            off += PAGE_SIZE;
        }
        Ok(())
    }

    fn translate_frame(
        &self,
        addr: VirtAddr,
    ) -> SysResult<alloc::sync::Arc<mm::frame::Frame>> {
        self.page_table
            .translate(addr.page_number())
            .map(|pte| alloc::sync::Arc::clone(pte.frame()))
            .ok_or(SysError::EFAULT)
    }

    /// Copies bytes out of this space into `buf`, faulting pages in for
    /// read as needed.
    pub fn copy_in(&self, addr: VirtAddr, buf: &mut [u8]) -> SysResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr
                .to_usize()
                .checked_add(done)
                .map(VirtAddr::new)
                .ok_or(SysError::EFAULT)?;
            let page_off = va.page_offset();
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            self.handle_page_fault(va, MemProt::R)?;
            let frame = self.translate_frame(va)?;
            frame.read_at(page_off, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies `buf` into this space, faulting pages in for write as needed.
    /// Fails with `EFAULT` where the target is not writable.
    pub fn copy_out(&self, addr: VirtAddr, buf: &[u8]) -> SysResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr
                .to_usize()
                .checked_add(done)
                .map(VirtAddr::new)
                .ok_or(SysError::EFAULT)?;
            let page_off = va.page_offset();
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            self.handle_page_fault(va, MemProt::W)?;
            let frame = self.translate_frame(va)?;
            frame.write_at(page_off, &buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Kernel-privileged write: stores `buf` at `addr` regardless of the
    /// zone's write protection, still honoring copy-on-write sharing. The
    /// loader uses this to patch relocations and zero segment tails inside
    /// read-only mappings.
    pub fn write_through(&self, addr: VirtAddr, buf: &[u8]) -> SysResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr
                .to_usize()
                .checked_add(done)
                .map(VirtAddr::new)
                .ok_or(SysError::EFAULT)?;
            let page_off = va.page_offset();
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            self.handle_page_fault(va, MemProt::R)?;
            let info = self.find(va)?;
            if !info.flags.contains(MapFlags::SHARED) {
                self.page_table.make_writable(va.page_number(), false)?;
            }
            let frame = self.translate_frame(va)?;
            frame.write_at(page_off, &buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Duplicates the address space for fork.
    ///
    /// The region and every zone are cloned structurally; mapped pages are
    /// shared with the child, copy-on-write for writable private zones and
    /// plainly shared for shm zones. Shm bindings are cloned and each shm
    /// zone registers one more attach.
    pub fn dup(&self) -> Arc<AddrSpace> {
        let page_table = PageTable::new();
        let mut opened: Vec<ZoneKind> = Vec::new();
        let inner = self.inner.lock();
        let region = inner.region.dup();
        let mut zones = BTreeMap::new();
        for (&key, zone) in &inner.zones {
            let dup = zone.dup_range(zone.addr(), zone.size(), zone.off());
            opened.push(dup.kind().clone());
            self.page_table.clone_range_cow(
                &page_table,
                zone.addr().page_number(),
                zone.size() / PAGE_SIZE,
                !zone.is_shared(),
            );
            zones.insert(key, dup);
        }
        let shms = inner.shms.clone();
        drop(inner);

        for kind in opened {
            kind.open();
        }
        Arc::new(AddrSpace {
            page_table,
            inner: SpinLock::new(AddrSpaceInner {
                region,
                zones,
                shms,
            }),
        })
    }

    /// Ordered view of the zones, for inspection and invariant checks.
    pub fn zones_snapshot(&self) -> Vec<ZoneInfo> {
        self.inner.lock().zones.values().map(Zone::info).collect()
    }

    /// Structural copy of the region allocator state.
    pub fn region_snapshot(&self) -> VirtRegion {
        self.inner.lock().region.clone()
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.page_table.mapped_pages()
    }

    pub(crate) fn page_table(&self) -> &PageTable {
        &self.page_table
    }
}

impl Drop for AddrSpace {
    /// Releases every zone; shm segments lose one attach each.
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        let zones: Vec<Zone> = core::mem::take(&mut inner.zones).into_values().collect();
        inner.shms.clear();
        drop(inner);
        for zone in zones {
            zone.kind().close();
        }
    }
}
