//! Hardware boundary.
//!
//! The rest of the kernel reaches the MMU only through [`Mmu`] and the CPU
//! only through `CpuContext` values handed to the switch primitive in
//! [`x86`], which is the single place touching control registers.

use x86_64::{PhysAddr, VirtAddr};

#[cfg(target_arch = "x86")]
pub mod x86;

/// Paging control registers.
pub trait Mmu {
    /// Loads the page-table-base register (CR3).
    fn load_directory(&mut self, directory: PhysAddr);

    /// Sets the paging-enable bit (CR0.PG). Once per boot.
    fn enable_paging(&mut self);

    /// Drops a stale translation of `page` from the TLB.
    fn invalidate_page(&mut self, page: VirtAddr);
}
