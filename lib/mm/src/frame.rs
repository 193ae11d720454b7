//! Module for managing allocatable frames (physical pages).
//!
//! A frame is a page-sized, page-aligned block of memory owned by a
//! [`Frame`] value. Frame indexes are handed out by a global bitmap
//! allocator capped at [`FRAME_COUNT`] frames, which is how physical-memory
//! pressure is modeled: when the bitmap is exhausted, allocation fails with
//! `ENOMEM`.
//!
//! A frame may be referenced from several places at once (page tables of
//! forked address spaces, the page cache of a shared memory segment); the
//! reference count is the `Arc<Frame>` strong count, and the frame returns
//! to the allocator when the last reference drops.

use core::{ptr::NonNull, sync::atomic::{AtomicUsize, Ordering}};

use bitmap_allocator::{BitAlloc, BitAlloc64K};
use spin::Once;

use config::mm::{FRAME_COUNT, PAGE_SIZE};
use mutex::SpinLock;
use systype::{SysError, SysResult};

use crate::address::PhysPageNum;

/// Global frame allocator. It allocates and deallocates allocatable frames.
static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator {
    allocator: SpinLock::new(BitAlloc64K::DEFAULT),
    init: Once::new(),
    used: AtomicUsize::new(0),
};

struct FrameAllocator {
    /// Bitmap allocator over frame indexes.
    allocator: SpinLock<BitAlloc64K>,
    /// Seeds the bitmap with `0..FRAME_COUNT` on first use.
    init: Once<()>,
    /// Number of frames currently allocated.
    used: AtomicUsize,
}

impl FrameAllocator {
    fn ensure_init(&self) {
        self.init.call_once(|| {
            self.allocator.lock().insert(0..FRAME_COUNT);
            log::debug!("frame allocator: {} allocatable frames", FRAME_COUNT);
        });
    }
}

/// Number of frames currently allocated.
pub fn frames_used() -> usize {
    FRAME_ALLOCATOR.used.load(Ordering::Relaxed)
}

/// Number of allocatable frames.
pub fn frames_total() -> usize {
    FRAME_COUNT
}

/// An allocated frame and its backing page of memory.
///
/// The backing page is zeroed on allocation. Constructing a `Frame`
/// allocates from the frame allocator; dropping it returns the frame.
#[derive(Debug)]
pub struct Frame {
    /// Physical page number of the frame.
    ppn: PhysPageNum,
    /// Backing storage, `PAGE_SIZE` bytes, page-aligned.
    ptr: NonNull<u8>,
}

// The backing page is exclusively owned by the `Frame`. Accesses through a
// shared `Frame` use the raw-pointer accessors below; serializing writes to
// a page shared between address spaces is userland's responsibility.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

fn page_layout() -> core::alloc::Layout {
    // PAGE_SIZE is a power of two, so this cannot fail.
    core::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

impl Frame {
    /// Allocates a zeroed frame.
    ///
    /// # Errors
    /// Returns `ENOMEM` when the frame allocator is exhausted.
    pub fn build() -> SysResult<Self> {
        FRAME_ALLOCATOR.ensure_init();
        let index = FRAME_ALLOCATOR
            .allocator
            .lock()
            .alloc()
            .ok_or(SysError::ENOMEM)?;
        // SAFETY: the layout is valid and non-zero-sized.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(page_layout()) };
        let Some(ptr) = NonNull::new(ptr) else {
            FRAME_ALLOCATOR.allocator.lock().dealloc(index);
            return Err(SysError::ENOMEM);
        };
        FRAME_ALLOCATOR.used.fetch_add(1, Ordering::Relaxed);
        Ok(Frame {
            ppn: PhysPageNum::new(index),
            ptr,
        })
    }

    /// Gets the physical page number of the frame.
    pub fn ppn(&self) -> PhysPageNum {
        self.ppn
    }

    /// Copies `buf.len()` bytes out of the frame starting at `off`.
    pub fn read_at(&self, off: usize, buf: &mut [u8]) {
        debug_assert!(off + buf.len() <= PAGE_SIZE);
        // SAFETY: the range is inside the backing page.
        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(off), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Copies `buf` into the frame starting at `off`.
    pub fn write_at(&self, off: usize, buf: &[u8]) {
        debug_assert!(off + buf.len() <= PAGE_SIZE);
        // SAFETY: the range is inside the backing page.
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr.as_ptr().add(off), buf.len());
        }
    }

    /// Copies the whole page of `other` into this frame.
    pub fn copy_from(&self, other: &Frame) {
        // SAFETY: distinct frames never share backing storage.
        unsafe {
            core::ptr::copy_nonoverlapping(other.ptr.as_ptr(), self.ptr.as_ptr(), PAGE_SIZE);
        }
    }
}

impl Drop for Frame {
    /// Deallocate the frame.
    fn drop(&mut self) {
        // SAFETY: the pointer was allocated with the same layout.
        unsafe {
            alloc::alloc::dealloc(self.ptr.as_ptr(), page_layout());
        }
        FRAME_ALLOCATOR.allocator.lock().dealloc(self.ppn.to_usize());
        FRAME_ALLOCATOR.used.fetch_sub(1, Ordering::Relaxed);
    }
}
