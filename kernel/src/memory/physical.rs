//! Kernel access to physical memory.

use x86_64::PhysAddr;

/// Translates a physical address into a pointer the kernel can dereference.
///
/// Handles are cheap to clone and every clone refers to the same memory.
///
/// # Safety
///
/// For every address the kernel hands out (bitmap storage, page directories,
/// page tables, allocated frames), the returned pointer must be valid for
/// reads and writes of the whole 4 KiB frame containing it and keep the
/// frame's alignment.
pub unsafe trait PhysicalMemory: Clone {
    fn as_mut_ptr<T>(&self, addr: PhysAddr) -> *mut T;
}

/// Physical memory reached through the identity mapping of kernel space.
///
/// Valid while paging is off, and afterwards for everything below the end of
/// the identity-mapped region.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapped;

unsafe impl PhysicalMemory for IdentityMapped {
    fn as_mut_ptr<T>(&self, addr: PhysAddr) -> *mut T {
        addr.as_u64() as usize as *mut T
    }
}
