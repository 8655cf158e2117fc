//! The kernel context object.
//!
//! Every piece of mutable kernel state (frame bitmap, placement cursor,
//! address spaces, process table, ready queue, current unit) hangs off one
//! `Kernel` value. Scheduling decisions come back as [`Transfer`]s; carrying
//! them out on the CPU is left to `arch`.

use core::fmt;

use log::{debug, info};
use x86_64::{structures::paging::PageTableFlags, PhysAddr, VirtAddr};

use crate::{
    arch::Mmu,
    memory::{
        paging::{PageDirectory, PageTableEntry},
        physical::PhysicalMemory,
        MemoryError, MemoryLayout, MemoryManager,
    },
    processes::{ContextSwitch, ProcessError, ProcessHandle, ProcessState, ProcessTable, Scheduler, Transfer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Memory(MemoryError),
    Process(ProcessError),
    NothingToRun,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Memory(err) => write!(f, "Memory error: {}", err),
            KernelError::Process(err) => write!(f, "Process error: {}", err),
            KernelError::NothingToRun => write!(f, "Scheduler returned!"),
        }
    }
}

impl From<MemoryError> for KernelError {
    fn from(err: MemoryError) -> Self {
        KernelError::Memory(err)
    }
}

impl From<ProcessError> for KernelError {
    fn from(err: ProcessError) -> Self {
        KernelError::Process(err)
    }
}

pub struct Kernel<M: PhysicalMemory, H: Mmu> {
    memory: MemoryManager<M>,
    mmu: H,
    processes: ProcessTable,
    scheduler: Scheduler,
}

impl<M: PhysicalMemory, H: Mmu> Kernel<M, H> {
    /// Brings the core up with the default memory layout.
    pub fn init(memory: M, mmu: H) -> Result<Self, KernelError> {
        Self::with_layout(memory, MemoryLayout::default(), mmu)
    }

    /// Frame allocator and paging, then an empty process pool and ready queue.
    pub fn with_layout(memory: M, layout: MemoryLayout, mut mmu: H) -> Result<Self, KernelError> {
        let memory = MemoryManager::init_paging(memory, layout, &mut mmu)?;
        let processes = ProcessTable::new();
        let scheduler = Scheduler::new();
        info!("Process table and ready queue initialized");

        Ok(Kernel {
            memory,
            mmu,
            processes,
            scheduler,
        })
    }

    pub fn memory(&self) -> &MemoryManager<M> {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryManager<M> {
        &mut self.memory
    }

    pub fn mmu(&self) -> &H {
        &self.mmu
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn current(&self) -> Option<ProcessHandle> {
        self.processes.current()
    }

    pub fn create_process(&mut self, entry_point: VirtAddr) -> Result<ProcessHandle, ProcessError> {
        self.processes.create(&mut self.memory, entry_point)
    }

    pub fn enqueue(&mut self, handle: ProcessHandle) {
        self.scheduler.enqueue(&mut self.processes, handle);
    }

    /// Terminates a unit and takes it off the ready queue. Its address space
    /// and stack are leaked.
    pub fn terminate(&mut self, handle: ProcessHandle) {
        self.scheduler.remove(&mut self.processes, handle);
        self.processes.terminate(handle);
    }

    /// Parks a unit until `unblock`. A blocked unit is never scheduled.
    pub fn block(&mut self, handle: ProcessHandle) -> bool {
        self.scheduler.remove(&mut self.processes, handle);
        self.processes.block(handle)
    }

    /// Makes a blocked unit ready and queues it.
    pub fn unblock(&mut self, handle: ProcessHandle) -> bool {
        if !self.processes.unblock(handle) {
            return false;
        }
        self.scheduler.enqueue(&mut self.processes, handle);
        true
    }

    /// Round-robin step: the head of the ready queue gets the CPU and the
    /// current unit, if still running, goes to the back of the queue. A
    /// current unit that was blocked or terminated stays off the queue.
    ///
    /// `None` means nobody else is ready and the caller keeps running.
    pub fn yield_now(&mut self) -> Option<Transfer> {
        let next = self.scheduler.dequeue(&mut self.processes)?;

        if let Some(current) = self.processes.current() {
            let running = self
                .processes
                .get(current)
                .is_some_and(|pcb| pcb.state() == ProcessState::Running);
            if running && current != next {
                self.scheduler.enqueue(&mut self.processes, current);
            }
        }

        self.switch_to(next)
    }

    /// Hands the CPU to `handle` and keeps the address space bookkeeping in
    /// step with the transfer.
    pub fn switch_to(&mut self, handle: ProcessHandle) -> Option<Transfer> {
        let transfer = self.processes.switch_to(handle)?;
        let directory = self.processes.get(handle).and_then(|pcb| pcb.directory());

        if let Some(directory) = directory {
            match transfer {
                // nothing is running yet, load the directory here
                Transfer::Enter { .. } => self.memory.switch_directory(directory, &mut self.mmu),
                // the switch primitive reloads CR3 from the saved context
                Transfer::Switch { .. } => self.memory.set_current_directory(directory),
            }
        }

        debug!("{:?}", transfer);
        Some(transfer)
    }

    /// Raw context pointers for executing `transfer`. They point into this
    /// kernel, which must not move before the switch happens.
    pub fn context_switch(&mut self, transfer: Transfer) -> Option<ContextSwitch> {
        self.processes.context_switch(transfer)
    }

    /// Maps a page, flushing the stale translation when a live mapping of
    /// the active address space is replaced.
    pub fn map(
        &mut self,
        directory: PageDirectory,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<PageTableEntry, MemoryError> {
        let previous = self.memory.map(directory, virt, phys, flags)?;
        if previous.is_present() && self.memory.current_directory() == Some(directory) {
            self.mmu.invalidate_page(virt);
        }
        Ok(previous)
    }

    /// Removes a mapping, flushing it if the address space is active.
    pub fn unmap(&mut self, directory: PageDirectory, virt: VirtAddr) -> Option<PageTableEntry> {
        let previous = self.memory.unmap(directory, virt)?;
        if self.memory.current_directory() == Some(directory) {
            self.mmu.invalidate_page(virt);
        }
        Some(previous)
    }
}
