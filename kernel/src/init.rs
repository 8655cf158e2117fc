//! Boot sequencing shared by the kernel image and the tests.

use arrayvec::ArrayVec;
use log::{info, warn};
use x86_64::VirtAddr;

use crate::{
    arch::Mmu,
    constants::processes::MAX_PROCESSES,
    kernel::{Kernel, KernelError},
    memory::physical::PhysicalMemory,
    processes::{ProcessHandle, Transfer},
};

/// Creates and queues one unit per entry point. A unit that cannot be
/// created is reported and skipped.
pub fn spawn_workloads<M: PhysicalMemory, H: Mmu>(
    kernel: &mut Kernel<M, H>,
    entries: &[VirtAddr],
) -> ArrayVec<ProcessHandle, MAX_PROCESSES> {
    let mut spawned = ArrayVec::new();

    for &entry in entries {
        match kernel.create_process(entry) {
            Ok(handle) => {
                kernel.enqueue(handle);
                info!("Process {} ready at {:#x}", handle.pid(), entry.as_u64());
                spawned.push(handle);
            }
            Err(err) => warn!("Skipping workload at {:#x}: {}", entry.as_u64(), err),
        }
    }

    kernel.processes().log_table();
    spawned
}

/// First scheduling decision. An empty ready queue here is fatal.
pub fn start<M: PhysicalMemory, H: Mmu>(kernel: &mut Kernel<M, H>) -> Result<Transfer, KernelError> {
    info!("Starting scheduler with {} ready processes", kernel.scheduler().len());
    kernel.yield_now().ok_or(KernelError::NothingToRun)
}
