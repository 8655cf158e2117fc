//! Two-level 32-bit paging: a page directory of 1024 entries pointing at page
//! tables of 1024 entries, each mapping one 4 KiB page.

use core::{
    fmt,
    ops::{Index, IndexMut},
    ptr,
};

use log::{debug, trace};
use x86_64::{
    structures::paging::{PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use super::{physical::PhysicalMemory, MemoryError, MemoryManager};
use crate::constants::memory::{ENTRY_COUNT, FLAGS_MASK, FRAME_MASK, FRAME_SIZE};

/// Flags of kernel mappings: present, writable, not reachable from user mode.
pub fn kernel_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE
}

/// One 32-bit directory or table entry. An absent entry is all zero.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn unused() -> Self {
        PageTableEntry(0)
    }

    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate((self.0 & FLAGS_MASK) as u64)
    }

    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new((self.0 & FRAME_MASK) as u64)
    }

    pub fn frame(&self) -> Option<PhysFrame> {
        self.is_present().then(|| PhysFrame::containing_address(self.addr()))
    }

    /// Points the entry at the frame containing `addr`. `addr` must fit in 32 bits.
    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        self.0 = (addr.as_u64() as u32 & FRAME_MASK) | (flags.bits() as u32 & FLAGS_MASK);
    }

    pub fn set_unused(&mut self) {
        self.0 = 0;
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("addr", &format_args!("{:#010x}", self.addr().as_u64()))
            .field("flags", &self.flags())
            .finish()
    }
}

/// A page directory or page table, exactly one frame in size.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRY_COUNT],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.set_unused();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Handle to an address space: the physical address of its directory, which
/// is also the value loaded into CR3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDirectory {
    phys: PhysAddr,
}

impl PageDirectory {
    pub fn physical_address(&self) -> PhysAddr {
        self.phys
    }
}

/// Top 10 bits of a virtual address.
pub fn directory_index(addr: VirtAddr) -> usize {
    ((addr.as_u64() >> 22) & 0x3FF) as usize
}

/// Middle 10 bits of a virtual address.
pub fn table_index(addr: VirtAddr) -> usize {
    ((addr.as_u64() >> 12) & 0x3FF) as usize
}

/// Low 12 bits of a virtual address.
pub fn page_offset(addr: VirtAddr) -> u64 {
    addr.as_u64() & FLAGS_MASK as u64
}

fn check_32bit(addr: u64) -> Result<(), MemoryError> {
    if addr > u32::MAX as u64 {
        return Err(MemoryError::AddressOutOfRange(addr));
    }
    Ok(())
}

/// Views the frame at `addr` as a page table.
///
/// # Safety
///
/// `addr` must be a directory or table handed out by this module, and no
/// other reference to the same frame may be alive for `'a`.
unsafe fn table_at<'a, M: PhysicalMemory>(memory: &M, addr: PhysAddr) -> &'a mut PageTable {
    &mut *memory.as_mut_ptr::<PageTable>(addr)
}

impl<M: PhysicalMemory> MemoryManager<M> {
    /// Allocates an empty directory or table from kernel placement memory.
    fn alloc_table(&mut self) -> Result<PhysAddr, MemoryError> {
        let addr = self.placement.alloc_aligned(FRAME_SIZE)?;
        // SAFETY: fresh placement memory, nothing else refers to it yet
        unsafe { table_at(&self.memory, addr).zero() };
        Ok(addr)
    }

    /// Creates an address space with no mappings.
    pub fn create_directory(&mut self) -> Result<PageDirectory, MemoryError> {
        let phys = self.alloc_table()?;
        Ok(PageDirectory { phys })
    }

    /// Maps the page containing `virt` to the frame containing `phys`.
    ///
    /// A missing page table is allocated on the way. An existing mapping is
    /// replaced without any TLB maintenance; the replaced entry is returned
    /// so the caller can decide whether to flush it.
    pub fn map(
        &mut self,
        directory: PageDirectory,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<PageTableEntry, MemoryError> {
        check_32bit(virt.as_u64())?;
        check_32bit(phys.as_u64())?;

        // SAFETY: directory handles only come from `create_directory`
        let dir = unsafe { table_at(&self.memory, directory.phys) };
        let dir_entry = &mut dir[directory_index(virt)];

        if !dir_entry.is_present() {
            let table = self.alloc_table()?;
            dir_entry.set(
                table,
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | flags,
            );
        }

        // SAFETY: present directory entries point at tables from `alloc_table`
        let table = unsafe { table_at(&self.memory, dir_entry.addr()) };
        let entry = &mut table[table_index(virt)];
        let previous = *entry;
        entry.set(phys, flags | PageTableFlags::PRESENT);

        Ok(previous)
    }

    /// Removes the mapping of the page containing `virt`, returning it.
    ///
    /// The frame is not released and the table stays allocated.
    pub fn unmap(&mut self, directory: PageDirectory, virt: VirtAddr) -> Option<PageTableEntry> {
        let entry = self.entry_mut(directory, virt)?;
        let previous = *entry;
        entry.set_unused();
        Some(previous)
    }

    /// Physical address `virt` maps to, or `None` when the page is unmapped.
    pub fn translate(&self, directory: PageDirectory, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: shared view only; `&self` prevents concurrent mutation
        let dir = unsafe { table_at(&self.memory, directory.phys) };
        let dir_entry = dir[directory_index(virt)];
        if !dir_entry.is_present() {
            return None;
        }

        let table = unsafe { table_at(&self.memory, dir_entry.addr()) };
        let entry = table[table_index(virt)];
        if !entry.is_present() {
            return None;
        }

        Some(entry.addr() + page_offset(virt))
    }

    /// Present entry mapping `virt`, if any.
    pub fn entry(&self, directory: PageDirectory, virt: VirtAddr) -> Option<PageTableEntry> {
        // SAFETY: see `translate`
        let dir = unsafe { table_at(&self.memory, directory.phys) };
        let dir_entry = dir[directory_index(virt)];
        if !dir_entry.is_present() {
            return None;
        }
        let entry = unsafe { table_at(&self.memory, dir_entry.addr()) }[table_index(virt)];
        entry.is_present().then_some(entry)
    }

    fn entry_mut(&mut self, directory: PageDirectory, virt: VirtAddr) -> Option<&mut PageTableEntry> {
        let dir = unsafe { table_at(&self.memory, directory.phys) };
        let dir_entry = dir[directory_index(virt)];
        if !dir_entry.is_present() {
            return None;
        }
        let entry = &mut unsafe { table_at(&self.memory, dir_entry.addr()) }[table_index(virt)];
        entry.is_present().then_some(entry)
    }

    /// Copies an address space.
    ///
    /// Every present table is duplicated. User pages get a private frame with
    /// a byte-for-byte copy of the source page; kernel pages are shared by
    /// copying the entry as is.
    pub fn clone_directory(&mut self, source: PageDirectory) -> Result<PageDirectory, MemoryError> {
        let clone = self.create_directory()?;
        let mut tables = 0;
        let mut copied_pages = 0;

        for dir_index in 0..ENTRY_COUNT {
            // SAFETY: both directories come from `create_directory` and are distinct frames
            let src_entry = unsafe { table_at(&self.memory, source.phys) }[dir_index];
            if !src_entry.is_present() {
                continue;
            }

            let table_phys = self.alloc_table()?;
            let clone_dir = unsafe { table_at(&self.memory, clone.phys) };
            clone_dir[dir_index].set(table_phys, src_entry.flags());
            tables += 1;

            for index in 0..ENTRY_COUNT {
                // SAFETY: source table and the fresh table are distinct frames
                let entry = unsafe { table_at(&self.memory, src_entry.addr()) }[index];
                if !entry.is_present() {
                    continue;
                }

                let new_entry = if entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
                    let frame = self.alloc_frame()?;
                    self.copy_frame(entry.addr(), frame.start_address());
                    copied_pages += 1;

                    let mut new_entry = PageTableEntry::unused();
                    new_entry.set(frame.start_address(), entry.flags());
                    new_entry
                } else {
                    entry
                };

                let table = unsafe { table_at(&self.memory, table_phys) };
                table[index] = new_entry;
            }
        }

        debug!(
            "cloned directory {:#x} into {:#x}: {} tables, {} private pages",
            source.phys.as_u64(),
            clone.phys.as_u64(),
            tables,
            copied_pages
        );

        Ok(clone)
    }

    fn copy_frame(&mut self, from: PhysAddr, to: PhysAddr) {
        trace!("copying frame {:#x} to {:#x}", from.as_u64(), to.as_u64());
        let src = self.memory.as_mut_ptr::<u8>(from);
        let dst = self.memory.as_mut_ptr::<u8>(to);
        // SAFETY: two distinct whole frames, `to` was just allocated
        unsafe { ptr::copy_nonoverlapping(src, dst, FRAME_SIZE) };
    }
}
