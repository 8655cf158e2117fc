//! Process control blocks, the ready queue and the saved CPU state they
//! switch between.

pub mod context;
pub mod process;
pub mod scheduler;

pub use context::{ContextSwitch, CpuContext};
pub use process::{Pid, ProcessError, ProcessHandle, ProcessState, ProcessTable, Transfer, PCB};
pub use scheduler::Scheduler;
