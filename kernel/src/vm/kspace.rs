//! The kernel heap: a shared [`VirtRegion`] over the kernel's heap range
//! plus the kernel page table.
//!
//! Unlike user spaces there is no demand paging here: a kernel virtual
//! range is either mapped eagerly (`vmalloc`, the module loader) or not
//! mapped at all, and access to an unmapped address is an error, not a
//! fault to resolve.

use alloc::sync::Arc;

use config::mm::{KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE, PAGE_MASK, PAGE_SIZE};
use mm::{address::VirtAddr, frame::Frame, vm_region::VirtRegion};
use mutex::SpinLock;
use spin::Lazy;
use systype::{memory_flags::MemProt, SysError, SysResult};

use super::page_table::{Mmu, PageTable};

/// The kernel address space singleton.
pub static KSPACE: Lazy<KernelSpace> = Lazy::new(KernelSpace::new);

/// The kernel heap region and page table.
pub struct KernelSpace {
    region: SpinLock<VirtRegion>,
    page_table: PageTable,
}

impl KernelSpace {
    fn new() -> Self {
        Self {
            region: SpinLock::new(VirtRegion::new(KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE)),
            page_table: PageTable::new(),
        }
    }

    /// Reserves a floating span of `size` bytes without mapping it.
    pub fn alloc_span(&self, size: usize) -> SysResult<usize> {
        self.region.lock().alloc(None, size)
    }

    /// Returns a span to the allocator, dropping any mappings inside it.
    pub fn free_span(&self, addr: usize, size: usize) -> SysResult<()> {
        self.page_table
            .unmap(VirtAddr::new(addr).page_number(), size / PAGE_SIZE);
        self.region.lock().free(addr, size)
    }

    /// Maps `frame` at `addr` with the given protection.
    pub fn map_frame(&self, addr: usize, frame: Arc<Frame>, prot: MemProt) -> SysResult<()> {
        debug_assert!(addr & PAGE_MASK == 0);
        self.page_table
            .map(VirtAddr::new(addr).page_number(), frame, prot.into())
    }

    /// Rewrites the protection of the mapped pages in `[addr, addr + size)`.
    pub fn protect(&self, addr: usize, size: usize, prot: MemProt) -> SysResult<()> {
        if addr & PAGE_MASK != 0 || size & PAGE_MASK != 0 {
            return Err(SysError::EINVAL);
        }
        if !self.region.lock().test(addr, size) {
            log::trace!("protect of unreserved kernel range {:#x}", addr);
            return Err(SysError::ENOMEM);
        }
        self.page_table
            .protect(VirtAddr::new(addr).page_number(), size / PAGE_SIZE, prot, true);
        Ok(())
    }

    /// Allocates and maps `size` bytes of zeroed kernel memory.
    pub fn vmalloc(&self, size: usize) -> SysResult<usize> {
        if size == 0 || size & PAGE_MASK != 0 {
            return Err(SysError::EINVAL);
        }
        let addr = self.alloc_span(size)?;
        for off in (0..size).step_by(PAGE_SIZE) {
            let frame = match Frame::build() {
                Ok(frame) => frame,
                Err(e) => {
                    self.free_span(addr, size).expect("span was just reserved");
                    return Err(e);
                }
            };
            self.map_frame(addr + off, Arc::new(frame), MemProt::RW)
                .expect("span cannot be mapped twice");
        }
        Ok(addr)
    }

    /// Releases memory obtained from [`vmalloc`](Self::vmalloc).
    ///
    /// # Panics
    /// Panics when the range was not allocated; that is a kernel bug, not
    /// an input condition.
    pub fn vfree(&self, addr: usize, size: usize) {
        self.free_span(addr, size).expect("vfree of unallocated range");
    }

    fn frame_at(&self, addr: usize) -> SysResult<Arc<Frame>> {
        self.page_table
            .translate(VirtAddr::new(addr).page_number())
            .map(|pte| Arc::clone(pte.frame()))
            .ok_or(SysError::EFAULT)
    }

    /// Reads mapped kernel memory at `addr`.
    pub fn read(&self, addr: usize, buf: &mut [u8]) -> SysResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr.checked_add(done).ok_or(SysError::EFAULT)?;
            let page_off = va & PAGE_MASK;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            self.frame_at(va)?.read_at(page_off, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Writes mapped kernel memory at `addr`.
    pub fn write(&self, addr: usize, buf: &[u8]) -> SysResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr.checked_add(done).ok_or(SysError::EFAULT)?;
            let page_off = va & PAGE_MASK;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            self.frame_at(va)?.write_at(page_off, &buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Free bytes left in the heap region.
    pub fn available(&self) -> usize {
        self.region.lock().available()
    }

    /// Span of the heap region in bytes.
    pub fn total(&self) -> usize {
        KERNEL_HEAP_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmalloc_maps_zeroed_writable_memory() {
        let addr = KSPACE.vmalloc(2 * PAGE_SIZE).unwrap();
        let mut buf = [0xFFu8; 32];
        KSPACE.read(addr + PAGE_SIZE - 16, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 32]);
        KSPACE.write(addr + PAGE_SIZE - 16, &[1u8; 32]).unwrap();
        KSPACE.read(addr + PAGE_SIZE - 16, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 32]);
        KSPACE.vfree(addr, 2 * PAGE_SIZE);
        assert_eq!(KSPACE.read(addr, &mut buf).unwrap_err(), SysError::EFAULT);
    }

    #[test]
    fn spans_are_exclusive_until_freed() {
        let a = KSPACE.alloc_span(PAGE_SIZE).unwrap();
        let b = KSPACE.alloc_span(PAGE_SIZE).unwrap();
        assert_ne!(a, b);
        KSPACE.free_span(a, PAGE_SIZE).unwrap();
        KSPACE.free_span(b, PAGE_SIZE).unwrap();
    }
}
