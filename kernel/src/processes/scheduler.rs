use log::{debug, warn};

use super::process::{ProcessHandle, ProcessState, ProcessTable};

/// Round-robin ready queue.
///
/// The queue is threaded through the `next` links of the process table, so
/// it only stores the two ends. A unit is on the queue iff its `queued` tag
/// is set.
#[derive(Debug, Default)]
pub struct Scheduler {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends a unit at the tail and marks it `Ready`.
    pub fn enqueue(&mut self, table: &mut ProcessTable, handle: ProcessHandle) {
        let Some(pcb) = table.get_mut(handle) else {
            debug!("enqueue: stale handle {:?}", handle);
            return;
        };
        if pcb.state() == ProcessState::Terminated {
            debug!("enqueue: process {} already terminated", handle.pid());
            return;
        }
        if pcb.queued {
            warn!("process {} is already on the ready queue", handle.pid());
            return;
        }

        pcb.set_state(ProcessState::Ready);
        pcb.next = None;
        pcb.queued = true;

        let slot = handle.slot();
        match self.tail {
            Some(tail) => table.slot_mut(tail).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
    }

    /// Pops the unit at the head.
    pub fn dequeue(&mut self, table: &mut ProcessTable) -> Option<ProcessHandle> {
        let slot = self.head?;
        let pcb = table.slot_mut(slot);
        self.head = pcb.next.take();
        pcb.queued = false;
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(table.handle_at(slot))
    }

    /// Unlinks a unit from anywhere in the queue. Returns whether it was queued.
    pub fn remove(&mut self, table: &mut ProcessTable, handle: ProcessHandle) -> bool {
        match table.get(handle) {
            Some(pcb) if pcb.queued => {}
            _ => return false,
        }
        let target = handle.slot();

        let mut previous: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            if slot == target {
                let next = table.slot_mut(slot).next.take();
                match previous {
                    Some(prev) => table.slot_mut(prev).next = next,
                    None => self.head = next,
                }
                if self.tail == Some(slot) {
                    self.tail = previous;
                }
                table.slot_mut(slot).queued = false;
                self.len -= 1;
                return true;
            }
            previous = Some(slot);
            cursor = table.slot(slot).next;
        }

        warn!("process {} tagged as queued but not linked", handle.pid());
        table.slot_mut(target).queued = false;
        false
    }

    /// Queue contents from head to tail.
    pub fn iter<'a>(&self, table: &'a ProcessTable) -> impl Iterator<Item = ProcessHandle> + 'a {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let slot = cursor?;
            cursor = table.slot(slot).next;
            Some(table.handle_at(slot))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::memory::KERNEL_SPACE_END,
        memory::{MemoryLayout, MemoryManager},
        testing::{RecordingMmu, SimulatedMemory},
    };
    use alloc::vec::Vec;
    use x86_64::VirtAddr;

    fn setup(count: usize) -> (ProcessTable, Vec<ProcessHandle>) {
        let memory = SimulatedMemory::new(KERNEL_SPACE_END);
        let mut memory =
            MemoryManager::init_paging(memory, MemoryLayout::default(), &mut RecordingMmu::default()).unwrap();
        let mut table = ProcessTable::new();
        let handles = (0..count)
            .map(|_| table.create(&mut memory, VirtAddr::new(0x0010_0000)).unwrap())
            .collect();
        (table, handles)
    }

    fn pids(scheduler: &Scheduler, table: &ProcessTable) -> Vec<u32> {
        scheduler.iter(table).map(|h| h.pid()).collect()
    }

    #[test]
    fn test_empty_queue() {
        let (mut table, _) = setup(0);
        let mut scheduler = Scheduler::new();
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.len(), 0);
        assert_eq!(scheduler.dequeue(&mut table), None);
    }

    #[test]
    fn test_fifo_order() {
        let (mut table, handles) = setup(3);
        let mut scheduler = Scheduler::new();
        for &handle in &handles {
            scheduler.enqueue(&mut table, handle);
        }
        assert_eq!(pids(&scheduler, &table), [1, 2, 3]);
        assert_eq!(scheduler.len(), 3);

        for &handle in &handles {
            assert_eq!(scheduler.dequeue(&mut table), Some(handle));
            assert!(!table.get(handle).unwrap().is_queued());
        }
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.dequeue(&mut table), None);
    }

    #[test]
    fn test_enqueue_marks_ready() {
        let (mut table, handles) = setup(1);
        let mut scheduler = Scheduler::new();
        table.block(handles[0]);

        scheduler.enqueue(&mut table, handles[0]);
        assert_eq!(table.get(handles[0]).unwrap().state(), ProcessState::Ready);
    }

    #[test]
    fn test_double_enqueue_is_ignored() {
        let (mut table, handles) = setup(2);
        let mut scheduler = Scheduler::new();
        scheduler.enqueue(&mut table, handles[0]);
        scheduler.enqueue(&mut table, handles[1]);
        scheduler.enqueue(&mut table, handles[0]);

        assert_eq!(pids(&scheduler, &table), [1, 2]);
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn test_terminated_units_are_not_queued() {
        let (mut table, handles) = setup(1);
        let mut scheduler = Scheduler::new();
        table.terminate(handles[0]);

        scheduler.enqueue(&mut table, handles[0]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_remove_from_head_middle_and_tail() {
        let (mut table, handles) = setup(4);
        let mut scheduler = Scheduler::new();
        for &handle in &handles {
            scheduler.enqueue(&mut table, handle);
        }

        assert!(scheduler.remove(&mut table, handles[1]));
        assert_eq!(pids(&scheduler, &table), [1, 3, 4]);

        assert!(scheduler.remove(&mut table, handles[0]));
        assert_eq!(pids(&scheduler, &table), [3, 4]);

        assert!(scheduler.remove(&mut table, handles[3]));
        assert_eq!(pids(&scheduler, &table), [3]);

        // tail was fixed up
        scheduler.enqueue(&mut table, handles[0]);
        assert_eq!(pids(&scheduler, &table), [3, 1]);

        assert!(!scheduler.remove(&mut table, handles[1]));
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn test_removing_last_unit_empties_queue() {
        let (mut table, handles) = setup(1);
        let mut scheduler = Scheduler::new();
        scheduler.enqueue(&mut table, handles[0]);

        assert!(scheduler.remove(&mut table, handles[0]));
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.iter(&table).count(), 0);
    }
}
