//! Host stand-ins for physical memory and the MMU.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    rc::Rc,
    vec::Vec,
};

use x86_64::{PhysAddr, VirtAddr};

use crate::{arch::Mmu, constants::memory::FRAME_SIZE, memory::physical::PhysicalMemory};

struct Buffer {
    base: *mut u8,
    layout: Layout,
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Zero-filled, page-aligned heap buffer standing in for physical memory
/// `[0, size)`. Clones share the buffer.
#[derive(Clone)]
pub struct SimulatedMemory {
    buffer: Rc<Buffer>,
}

impl SimulatedMemory {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, FRAME_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "simulated memory allocation failed");
        SimulatedMemory {
            buffer: Rc::new(Buffer { base, layout }),
        }
    }

    pub fn size(&self) -> usize {
        self.buffer.layout.size()
    }
}

unsafe impl PhysicalMemory for SimulatedMemory {
    fn as_mut_ptr<T>(&self, addr: PhysAddr) -> *mut T {
        let offset = addr.as_u64() as usize;
        assert!(
            offset < self.size(),
            "physical address {:#x} outside simulated memory",
            offset
        );
        unsafe { self.buffer.base.add(offset) as *mut T }
    }
}

/// Records every MMU operation instead of performing it.
#[derive(Debug, Default)]
pub struct RecordingMmu {
    pub loaded: Vec<PhysAddr>,
    pub paging_enabled: usize,
    pub invalidated: Vec<VirtAddr>,
}

impl Mmu for RecordingMmu {
    fn load_directory(&mut self, directory: PhysAddr) {
        self.loaded.push(directory);
    }

    fn enable_paging(&mut self) {
        self.paging_enabled += 1;
    }

    fn invalidate_page(&mut self, page: VirtAddr) {
        self.invalidated.push(page);
    }
}
