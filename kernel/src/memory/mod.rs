pub mod bitmap_frame_allocator;
pub mod bump_allocator;
pub mod paging;
pub mod physical;

use crate::{
    arch::Mmu,
    constants::memory::{FRAME_SIZE, KERNEL_SPACE_END, MEMORY_SIZE, PLACEMENT_START},
};
use bitmap_frame_allocator::BitmapFrameAllocator;
use bump_allocator::BumpAllocator;
use core::fmt;
use log::info;
use paging::PageDirectory;
use physical::PhysicalMemory;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame},
    PhysAddr, VirtAddr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    OutOfFrames,
    PlacementExhausted { requested: usize, remaining: usize },
    AddressOutOfRange(u64),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfFrames => write!(f, "No free physical frames"),
            MemoryError::PlacementExhausted {
                requested,
                remaining,
            } => write!(
                f,
                "Kernel placement memory exhausted ({} bytes requested, {} left)",
                requested, remaining
            ),
            MemoryError::AddressOutOfRange(addr) => {
                write!(f, "Address {:#x} does not fit in 32 bits", addr)
            }
        }
    }
}

/// Physical memory geometry.
///
/// * `memory_size`: bytes of physical memory managed by the frame bitmap
/// * `kernel_space_end`: end of the identity-mapped kernel region; its frames
///   are reserved for the kernel and placement memory must fit below it
/// * `placement_start`: first byte handed out by the placement allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub memory_size: usize,
    pub kernel_space_end: usize,
    pub placement_start: usize,
}

impl MemoryLayout {
    pub const fn new() -> Self {
        MemoryLayout {
            memory_size: MEMORY_SIZE,
            kernel_space_end: KERNEL_SPACE_END,
            placement_start: PLACEMENT_START,
        }
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of physical memory and of every address space.
///
/// * `memory`: how the kernel reaches physical addresses
/// * `placement`: kernel metadata allocator (bitmap, directories, tables, stacks)
/// * `frames`: physical frame bitmap
/// * `kernel_directory`: the identity-mapped kernel address space, once built
/// * `current_directory`: the address space loaded in the MMU
pub struct MemoryManager<M: PhysicalMemory> {
    pub(crate) memory: M,
    placement: BumpAllocator,
    frames: BitmapFrameAllocator<M>,
    kernel_directory: Option<PageDirectory>,
    current_directory: Option<PageDirectory>,
}

impl<M: PhysicalMemory> MemoryManager<M> {
    /// Sets up placement and frame allocation without touching paging.
    ///
    /// Frames of the kernel region are reserved so they are never handed out
    /// as process memory.
    pub fn new(memory: M, layout: MemoryLayout) -> Result<Self, MemoryError> {
        let mut placement = BumpAllocator::new(
            PhysAddr::new(layout.placement_start as u64),
            PhysAddr::new(layout.kernel_space_end as u64),
        );
        let mut frames = BitmapFrameAllocator::init(memory.clone(), &mut placement, layout.memory_size)?;
        frames.reserve_range(PhysAddr::new(0), PhysAddr::new(layout.kernel_space_end as u64));

        Ok(MemoryManager {
            memory,
            placement,
            frames,
            kernel_directory: None,
            current_directory: None,
        })
    }

    /// Builds the kernel address space, identity-maps kernel space and turns
    /// paging on. Being a constructor, it can only happen once per manager.
    pub fn init_paging(memory: M, layout: MemoryLayout, mmu: &mut impl Mmu) -> Result<Self, MemoryError> {
        let mut manager = Self::new(memory, layout)?;

        let kernel_directory = manager.create_directory()?;
        manager.identity_map(kernel_directory, layout.kernel_space_end)?;
        manager.kernel_directory = Some(kernel_directory);

        manager.switch_directory(kernel_directory, mmu);
        mmu.enable_paging();

        info!(
            "Paging enabled: kernel directory at {:#x}, {} of {} frames free",
            kernel_directory.physical_address().as_u64(),
            manager.frames.free_frames(),
            manager.frames.total_frames()
        );

        Ok(manager)
    }

    pub fn kernel_directory(&self) -> Option<PageDirectory> {
        self.kernel_directory
    }

    pub fn current_directory(&self) -> Option<PageDirectory> {
        self.current_directory
    }

    /// Makes `directory` the active address space.
    pub fn switch_directory(&mut self, directory: PageDirectory, mmu: &mut impl Mmu) {
        self.current_directory = Some(directory);
        mmu.load_directory(directory.physical_address());
    }

    /// Records `directory` as active when the context switch primitive loads
    /// it into the MMU itself.
    pub(crate) fn set_current_directory(&mut self, directory: PageDirectory) {
        self.current_directory = Some(directory);
    }

    pub fn alloc_frame(&mut self) -> Result<PhysFrame, MemoryError> {
        self.frames.allocate_frame().ok_or(MemoryError::OutOfFrames)
    }

    /// # Safety
    ///
    /// Nothing may still map or otherwise use `frame`.
    pub unsafe fn free_frame(&mut self, frame: PhysFrame) {
        self.frames.deallocate_frame(frame);
    }

    pub fn frames(&self) -> &BitmapFrameAllocator<M> {
        &self.frames
    }

    pub fn placement(&self) -> &BumpAllocator {
        &self.placement
    }

    /// Carves a page-aligned kernel stack out of placement memory and returns
    /// its lowest address.
    pub fn alloc_kernel_stack(&mut self, size: usize) -> Result<PhysAddr, MemoryError> {
        self.placement.alloc_aligned(size)
    }

    /// Identity maps `[0, end)` with kernel-only read/write access.
    fn identity_map(&mut self, directory: PageDirectory, end: usize) -> Result<(), MemoryError> {
        for addr in (0..end as u64).step_by(FRAME_SIZE) {
            self.map(
                directory,
                VirtAddr::new(addr),
                PhysAddr::new(addr),
                paging::kernel_flags(),
            )?;
        }
        Ok(())
    }
}
