use core::fmt;

use log::{debug, info};
use x86_64::{PhysAddr, VirtAddr};

use super::context::{ContextSwitch, CpuContext};
use crate::{
    constants::processes::{FIRST_PID, INITIAL_EFLAGS, MAX_PROCESSES, PROCESS_STACK_SIZE},
    memory::{paging::PageDirectory, physical::PhysicalMemory, MemoryError, MemoryManager},
};

pub type Pid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    TableFull,
    PagingNotInitialized,
    InvalidEntryPoint(u64),
    OutOfMemory(MemoryError),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::TableFull => write!(f, "Process table full"),
            ProcessError::PagingNotInitialized => write!(f, "No kernel address space to clone"),
            ProcessError::InvalidEntryPoint(addr) => {
                write!(f, "Entry point {:#x} does not fit in 32 bits", addr)
            }
            ProcessError::OutOfMemory(err) => write!(f, "Out of memory: {}", err),
        }
    }
}

impl From<MemoryError> for ProcessError {
    fn from(err: MemoryError) -> Self {
        ProcessError::OutOfMemory(err)
    }
}

/// Stable reference to a process: its slot in the table plus its pid.
///
/// Once the slot is recycled the pids differ and the handle goes stale;
/// operations on stale handles do nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    slot: usize,
    pid: Pid,
}

impl ProcessHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// What the CPU has to do after a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Save the running unit into `from`, resume `to`.
    Switch {
        from: ProcessHandle,
        to: ProcessHandle,
    },
    /// First activation: nothing to save, jump into `to`. Never returns.
    Enter { to: ProcessHandle },
}

impl Transfer {
    pub fn target(&self) -> ProcessHandle {
        match *self {
            Transfer::Switch { to, .. } | Transfer::Enter { to } => to,
        }
    }
}

#[derive(Debug)]
pub struct PCB {
    pid: Pid,
    state: ProcessState,
    context: CpuContext,
    directory: Option<PageDirectory>,
    kernel_stack: Option<PhysAddr>,
    // ready queue membership, only touched by the scheduler
    pub(crate) next: Option<usize>,
    pub(crate) queued: bool,
}

impl PCB {
    fn unused() -> Self {
        PCB {
            pid: 0,
            state: ProcessState::Terminated,
            context: CpuContext::zero(),
            directory: None,
            kernel_stack: None,
            next: None,
            queued: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn context(&self) -> &CpuContext {
        &self.context
    }

    pub fn directory(&self) -> Option<PageDirectory> {
        self.directory
    }

    /// Lowest address of the kernel stack.
    pub fn kernel_stack(&self) -> Option<PhysAddr> {
        self.kernel_stack
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }
}

/// Fixed pool of process control blocks.
///
/// A `Terminated` slot is free, whether it was never used or its process
/// finished. Terminating does not give back the address space, frames or
/// stack of a process.
pub struct ProcessTable {
    slots: [PCB; MAX_PROCESSES],
    next_pid: Pid,
    current: Option<usize>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            slots: core::array::from_fn(|_| PCB::unused()),
            next_pid: FIRST_PID,
            current: None,
        }
    }

    fn slot_of(&self, handle: ProcessHandle) -> Option<usize> {
        let pcb = self.slots.get(handle.slot)?;
        (pcb.pid != 0 && pcb.pid == handle.pid).then_some(handle.slot)
    }

    pub(crate) fn handle_at(&self, slot: usize) -> ProcessHandle {
        ProcessHandle {
            slot,
            pid: self.slots[slot].pid,
        }
    }

    pub fn get(&self, handle: ProcessHandle) -> Option<&PCB> {
        self.slot_of(handle).map(|slot| &self.slots[slot])
    }

    pub(crate) fn get_mut(&mut self, handle: ProcessHandle) -> Option<&mut PCB> {
        self.slot_of(handle).map(move |slot| &mut self.slots[slot])
    }

    pub(crate) fn slot(&self, slot: usize) -> &PCB {
        &self.slots[slot]
    }

    pub(crate) fn slot_mut(&mut self, slot: usize) -> &mut PCB {
        &mut self.slots[slot]
    }

    /// The unit currently owning the CPU.
    pub fn current(&self) -> Option<ProcessHandle> {
        self.current.map(|slot| self.handle_at(slot))
    }

    /// Handle of the live process with `pid`.
    pub fn handle_of(&self, pid: Pid) -> Option<ProcessHandle> {
        self.slots
            .iter()
            .position(|pcb| pcb.pid == pid && pid != 0 && pcb.state != ProcessState::Terminated)
            .map(|slot| self.handle_at(slot))
    }

    /// Handles of every process that has not terminated, in slot order.
    pub fn iter_live(&self) -> impl Iterator<Item = ProcessHandle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, pcb)| pcb.state != ProcessState::Terminated)
            .map(|(slot, _)| self.handle_at(slot))
    }

    /// First free slot. The running unit's slot stays off limits even once
    /// terminated, its context is still written on the way out.
    fn free_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .position(|(slot, pcb)| {
                pcb.state == ProcessState::Terminated && self.current != Some(slot)
            })
    }

    /// Creates a process that will start at `entry_point` in a copy of the
    /// kernel address space, on a fresh kernel stack.
    pub fn create<M: PhysicalMemory>(
        &mut self,
        memory: &mut MemoryManager<M>,
        entry_point: VirtAddr,
    ) -> Result<ProcessHandle, ProcessError> {
        let slot = self.free_slot().ok_or(ProcessError::TableFull)?;
        let entry = u32::try_from(entry_point.as_u64())
            .map_err(|_| ProcessError::InvalidEntryPoint(entry_point.as_u64()))?;
        let kernel_directory = memory
            .kernel_directory()
            .ok_or(ProcessError::PagingNotInitialized)?;

        let directory = memory.clone_directory(kernel_directory)?;
        let stack = memory.alloc_kernel_stack(PROCESS_STACK_SIZE)?;
        let stack_top = stack.as_u64() + PROCESS_STACK_SIZE as u64;

        let pid = self.next_pid;
        self.next_pid += 1;

        let pcb = &mut self.slots[slot];
        pcb.pid = pid;
        pcb.state = ProcessState::Ready;
        pcb.directory = Some(directory);
        pcb.kernel_stack = Some(stack);
        pcb.next = None;
        pcb.queued = false;
        pcb.context = CpuContext::initial(
            entry,
            stack_top as u32,
            INITIAL_EFLAGS,
            directory.physical_address().as_u64() as u32,
        );

        info!(
            "Created process {} in slot {} (entry {:#x}, stack top {:#x})",
            pid, slot, entry, stack_top
        );

        Ok(ProcessHandle { slot, pid })
    }

    /// Marks the process finished. Its memory is not reclaimed.
    pub fn terminate(&mut self, handle: ProcessHandle) {
        let Some(pcb) = self.get_mut(handle) else {
            debug!("terminate: stale handle {:?}", handle);
            return;
        };
        if pcb.state == ProcessState::Terminated {
            return;
        }
        pcb.state = ProcessState::Terminated;
        info!("Terminated process {} (address space and stack not reclaimed)", handle.pid);
    }

    /// Parks a ready or running process. Nothing in the kernel wakes it but
    /// an explicit `unblock`.
    pub fn block(&mut self, handle: ProcessHandle) -> bool {
        match self.get_mut(handle) {
            Some(pcb) if matches!(pcb.state, ProcessState::Ready | ProcessState::Running) => {
                pcb.state = ProcessState::Blocked;
                true
            }
            _ => false,
        }
    }

    /// Makes a blocked process ready again.
    pub fn unblock(&mut self, handle: ProcessHandle) -> bool {
        match self.get_mut(handle) {
            Some(pcb) if pcb.state == ProcessState::Blocked => {
                pcb.state = ProcessState::Ready;
                true
            }
            _ => false,
        }
    }

    /// Hands the CPU to `handle`.
    ///
    /// Returns what the CPU must do, or `None` when nothing changes hands:
    /// stale or terminated target, or target already running.
    pub fn switch_to(&mut self, handle: ProcessHandle) -> Option<Transfer> {
        let Some(target) = self.slot_of(handle) else {
            debug!("switch_to: stale handle {:?}", handle);
            return None;
        };
        if self.slots[target].state == ProcessState::Terminated {
            debug!("switch_to: process {} already terminated", handle.pid);
            return None;
        }
        if self.current == Some(target) {
            self.slots[target].state = ProcessState::Running;
            return None;
        }

        let previous = self.current.replace(target);
        self.slots[target].state = ProcessState::Running;

        match previous {
            Some(prev) => {
                if self.slots[prev].state == ProcessState::Running {
                    self.slots[prev].state = ProcessState::Ready;
                }
                Some(Transfer::Switch {
                    from: self.handle_at(prev),
                    to: handle,
                })
            }
            None => Some(Transfer::Enter { to: handle }),
        }
    }

    /// Pointers into the table for executing `transfer`.
    pub fn context_switch(&mut self, transfer: Transfer) -> Option<ContextSwitch> {
        let load = &self.slots[self.slot_of(transfer.target())?].context as *const CpuContext;
        let save = match transfer {
            Transfer::Switch { from, .. } => {
                let slot = self.slot_of(from)?;
                Some(&mut self.slots[slot].context as *mut CpuContext)
            }
            Transfer::Enter { .. } => None,
        };
        Some(ContextSwitch { save, load })
    }

    pub fn log_table(&self) {
        debug!("Process Table Contents:");
        debug!("========================");

        let mut live = 0;
        for (slot, pcb) in self.slots.iter().enumerate() {
            if pcb.state == ProcessState::Terminated {
                continue;
            }
            live += 1;
            debug!(
                "slot {} PID {}: State: {:?}, queued: {}, ESP: {:#x}, EIP: {:#x}, CR3: {:#x}",
                slot,
                pcb.pid,
                pcb.state,
                pcb.queued,
                pcb.context.esp,
                pcb.context.eip,
                pcb.context.cr3
            );
        }
        if live == 0 {
            debug!("No processes found");
        }
        debug!("========================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::memory::KERNEL_SPACE_END,
        memory::MemoryLayout,
        testing::{RecordingMmu, SimulatedMemory},
    };

    const ENTRY: u64 = 0x0010_4000;

    fn memory() -> MemoryManager<SimulatedMemory> {
        let memory = SimulatedMemory::new(KERNEL_SPACE_END);
        MemoryManager::init_paging(memory, MemoryLayout::default(), &mut RecordingMmu::default()).unwrap()
    }

    fn spawn(table: &mut ProcessTable, memory: &mut MemoryManager<SimulatedMemory>) -> ProcessHandle {
        table.create(memory, VirtAddr::new(ENTRY)).unwrap()
    }

    #[test]
    fn test_fresh_table_is_all_free() {
        let table = ProcessTable::new();
        assert_eq!(table.iter_live().count(), 0);
        assert_eq!(table.current(), None);
        for slot in 0..MAX_PROCESSES {
            assert_eq!(table.slot(slot).state(), ProcessState::Terminated);
            assert_eq!(table.slot(slot).pid(), 0);
            assert_eq!(table.slot(slot).next, None);
        }
    }

    #[test]
    fn test_create_builds_initial_context() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        let handle = spawn(&mut table, &mut memory);

        let pcb = table.get(handle).unwrap();
        assert_eq!(pcb.pid(), FIRST_PID);
        assert_eq!(pcb.state(), ProcessState::Ready);

        let directory = pcb.directory().unwrap();
        assert_ne!(Some(directory), memory.kernel_directory());

        let stack = pcb.kernel_stack().unwrap();
        let ctx = pcb.context();
        assert_eq!(ctx.eip, ENTRY as u32);
        assert_eq!(ctx.esp as u64, stack.as_u64() + PROCESS_STACK_SIZE as u64);
        assert_eq!(ctx.eflags, INITIAL_EFLAGS);
        assert_eq!(ctx.cr3 as u64, directory.physical_address().as_u64());
        assert_eq!((ctx.eax, ctx.ebx, ctx.ebp), (0, 0, 0));

        // the new address space still sees the kernel
        assert_eq!(
            memory.translate(directory, VirtAddr::new(ENTRY)),
            Some(PhysAddr::new(ENTRY))
        );
    }

    #[test]
    fn test_pool_exhaustion_and_slot_reuse() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        let handles: alloc::vec::Vec<_> = (0..MAX_PROCESSES)
            .map(|_| spawn(&mut table, &mut memory))
            .collect();

        assert_eq!(
            table.create(&mut memory, VirtAddr::new(ENTRY)),
            Err(ProcessError::TableFull)
        );

        let victim = handles[5];
        table.terminate(victim);
        let reused = spawn(&mut table, &mut memory);

        assert_eq!(reused.slot(), victim.slot());
        let highest = handles.iter().map(|h| h.pid()).max().unwrap();
        assert!(reused.pid() > highest);

        // the old handle no longer reaches the slot
        assert!(table.get(victim).is_none());
        assert_eq!(table.get(reused).unwrap().state(), ProcessState::Ready);
    }

    #[test]
    fn test_pids_are_monotonic() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        let a = spawn(&mut table, &mut memory);
        table.terminate(a);
        let b = spawn(&mut table, &mut memory);

        assert_eq!(a.slot(), b.slot());
        assert_eq!(b.pid(), a.pid() + 1);
    }

    #[test]
    fn test_create_without_paging_fails() {
        let memory = SimulatedMemory::new(KERNEL_SPACE_END);
        let mut memory = MemoryManager::new(memory, MemoryLayout::default()).unwrap();
        let mut table = ProcessTable::new();

        assert_eq!(
            table.create(&mut memory, VirtAddr::new(ENTRY)),
            Err(ProcessError::PagingNotInitialized)
        );
    }

    #[test]
    fn test_create_rejects_entry_above_4gib() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        assert_eq!(
            table.create(&mut memory, VirtAddr::new(0x1_0000_0000)),
            Err(ProcessError::InvalidEntryPoint(0x1_0000_0000))
        );
        assert_eq!(table.iter_live().count(), 0);
    }

    #[test]
    fn test_create_out_of_placement_memory_keeps_slot_free() {
        let memory = SimulatedMemory::new(KERNEL_SPACE_END);
        // leaves room for the bitmap, the kernel directory and its table only
        let layout = MemoryLayout {
            placement_start: KERNEL_SPACE_END - 3 * 4096,
            ..MemoryLayout::default()
        };
        let mut memory = MemoryManager::init_paging(memory, layout, &mut RecordingMmu::default()).unwrap();
        let mut table = ProcessTable::new();

        let err = table.create(&mut memory, VirtAddr::new(ENTRY)).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::OutOfMemory(MemoryError::PlacementExhausted { .. })
        ));
        assert_eq!(table.iter_live().count(), 0);
    }

    #[test]
    fn test_terminate_is_idempotent_and_ignores_stale_handles() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        let handle = spawn(&mut table, &mut memory);

        table.terminate(handle);
        table.terminate(handle);
        assert_eq!(table.get(handle).unwrap().state(), ProcessState::Terminated);

        let other = spawn(&mut table, &mut memory);
        // `handle` is stale now that its slot was recycled
        table.terminate(handle);
        assert_eq!(table.get(other).unwrap().state(), ProcessState::Ready);
    }

    #[test]
    fn test_first_switch_enters_without_saving() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        let handle = spawn(&mut table, &mut memory);

        assert_eq!(table.switch_to(handle), Some(Transfer::Enter { to: handle }));
        assert_eq!(table.current(), Some(handle));
        assert_eq!(table.get(handle).unwrap().state(), ProcessState::Running);

        let switch = table.context_switch(Transfer::Enter { to: handle }).unwrap();
        assert!(switch.save.is_none());
        assert_eq!(unsafe { (*switch.load).eip }, ENTRY as u32);
    }

    #[test]
    fn test_switch_demotes_previous() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        let a = spawn(&mut table, &mut memory);
        let b = spawn(&mut table, &mut memory);

        table.switch_to(a);
        assert_eq!(table.switch_to(b), Some(Transfer::Switch { from: a, to: b }));
        assert_eq!(table.get(a).unwrap().state(), ProcessState::Ready);
        assert_eq!(table.get(b).unwrap().state(), ProcessState::Running);
        assert_eq!(table.current(), Some(b));

        let switch = table.context_switch(Transfer::Switch { from: a, to: b }).unwrap();
        assert!(switch.save.is_some());
        assert_ne!(switch.save.unwrap() as *const CpuContext, switch.load);
    }

    #[test]
    fn test_switch_to_terminated_or_current_is_noop() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        let a = spawn(&mut table, &mut memory);
        let b = spawn(&mut table, &mut memory);

        table.switch_to(a);
        assert_eq!(table.switch_to(a), None);

        table.terminate(b);
        assert_eq!(table.switch_to(b), None);
        assert_eq!(table.current(), Some(a));
    }

    #[test]
    fn test_switch_away_from_terminated_keeps_it_terminated() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        let a = spawn(&mut table, &mut memory);
        let b = spawn(&mut table, &mut memory);

        table.switch_to(a);
        table.terminate(a);
        table.switch_to(b);
        assert_eq!(table.get(a).unwrap().state(), ProcessState::Terminated);
    }

    #[test]
    fn test_running_terminated_slot_is_not_reused() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        let a = spawn(&mut table, &mut memory);
        table.switch_to(a);
        table.terminate(a);

        let b = spawn(&mut table, &mut memory);
        assert_ne!(b.slot(), a.slot());
    }

    #[test]
    fn test_block_and_unblock() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        let a = spawn(&mut table, &mut memory);

        assert!(!table.unblock(a));
        assert!(table.block(a));
        assert_eq!(table.get(a).unwrap().state(), ProcessState::Blocked);
        assert!(!table.block(a));
        assert!(table.unblock(a));
        assert_eq!(table.get(a).unwrap().state(), ProcessState::Ready);
    }

    #[test]
    fn test_handle_lookup_by_pid() {
        let mut memory = memory();
        let mut table = ProcessTable::new();
        let a = spawn(&mut table, &mut memory);
        let b = spawn(&mut table, &mut memory);

        assert_eq!(table.handle_of(b.pid()), Some(b));
        table.terminate(a);
        assert_eq!(table.handle_of(a.pid()), None);
        assert_eq!(table.handle_of(0), None);
    }
}
