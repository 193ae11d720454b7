//! Memory layout

/// Page size
pub const PAGE_SIZE: usize = 4096;
/// Mask of the in-page offset bits
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Size of physical memory backing the frame allocator
pub const RAM_SIZE: usize = 128 * 1024 * 1024;
/// Number of allocatable frames
pub const FRAME_COUNT: usize = RAM_SIZE / PAGE_SIZE;

/// Lowest user virtual address
pub const USER_BASE: usize = 0x10000;
/// One past the highest user virtual address
pub const USER_TOP: usize = 0x4000_0000_0000;

/// Page-aligned mask applied to the two ASLR deltas that shrink the user
/// region at its low and high bounds.
pub const ASLR_MASK: usize = 0xFFFF_F000;

/// Start of the kernel heap region
pub const KERNEL_HEAP_BASE: usize = 0xFFFF_FFC1_0000_0000;
/// Size of the kernel heap region
pub const KERNEL_HEAP_SIZE: usize = 512 * 1024 * 1024;
