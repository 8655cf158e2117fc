/// Capacity of the process table.
pub const MAX_PROCESSES: usize = 32;

/// Kernel stack size of every process. Stacks grow downward from base + size.
pub const PROCESS_STACK_SIZE: usize = 4096;

/// EFLAGS of a fresh process: only IF (interrupts enabled) set.
pub const INITIAL_EFLAGS: u32 = 0x200;

/// First pid handed out. Pid 0 marks a slot that was never used.
pub const FIRST_PID: u32 = 1;
