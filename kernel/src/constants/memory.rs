//! Physical memory geometry and paging structure layout.

pub const FRAME_SIZE: usize = 4096;

/// Entries per page directory and per page table (32-bit, non-PAE paging).
pub const ENTRY_COUNT: usize = 1024;

/// Bits of an entry holding the frame address.
pub const FRAME_MASK: u32 = 0xFFFF_F000;
/// Bits of an entry holding the flags, also the in-page offset of an address.
pub const FLAGS_MASK: u32 = 0x0000_0FFF;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFFFFFFFFFFFFFF;

// Physical memory assumed present on the machine
pub const MEMORY_SIZE: usize = 16 * 1024 * 1024; // 16 MB

// Identity-mapped, kernel-owned region. The placement allocator never grows past it.
pub const KERNEL_SPACE_END: usize = 4 * 1024 * 1024; // 4 MB

// Where placement allocation starts when the kernel image end is not known
pub const PLACEMENT_START: usize = 0x100000; // 1 MB

// Natural alignment handed out by unaligned placement allocations
pub const PLACEMENT_WORD_ALIGN: usize = 8;
