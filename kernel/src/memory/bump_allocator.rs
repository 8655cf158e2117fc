//! Placement Allocator
//!
//! - Hands out kernel memory before any other allocator exists
//! - Moves a cursor forward and never frees
//! - Backs the frame bitmap, page directories, page tables and kernel stacks

use crate::constants::memory::{FRAME_SIZE, PLACEMENT_WORD_ALIGN};
use x86_64::PhysAddr;

use super::MemoryError;

/// Monotonic placement allocator over kernel space
///
/// * `cursor`: next free byte
/// * `limit`: first byte that may not be handed out
#[derive(Debug)]
pub struct BumpAllocator {
    cursor: u64,
    limit: u64,
}

impl BumpAllocator {
    /// Creates an allocator handing out `[start, limit)`
    pub fn new(start: PhysAddr, limit: PhysAddr) -> Self {
        BumpAllocator {
            cursor: start.as_u64(),
            limit: limit.as_u64(),
        }
    }

    /// Allocates `size` bytes aligned to a machine word
    pub fn alloc(&mut self, size: usize) -> Result<PhysAddr, MemoryError> {
        self.alloc_with_align(size, PLACEMENT_WORD_ALIGN)
    }

    /// Allocates `size` bytes starting on a page boundary
    ///
    /// The cursor is rounded up to the next page first, so the gap below it
    /// is lost for good.
    pub fn alloc_aligned(&mut self, size: usize) -> Result<PhysAddr, MemoryError> {
        self.alloc_with_align(size, FRAME_SIZE)
    }

    fn alloc_with_align(&mut self, size: usize, align: usize) -> Result<PhysAddr, MemoryError> {
        let start = align_up(self.cursor, align as u64);
        let end = start.checked_add(size as u64);

        match end {
            Some(end) if end <= self.limit => {
                self.cursor = end;
                Ok(PhysAddr::new(start))
            }
            _ => Err(MemoryError::PlacementExhausted {
                requested: size,
                remaining: self.remaining(),
            }),
        }
    }

    pub fn cursor(&self) -> PhysAddr {
        PhysAddr::new(self.cursor)
    }

    /// Bytes left before the limit, ignoring alignment padding
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.cursor) as usize
    }
}

fn align_up(addr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}
