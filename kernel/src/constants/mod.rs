//! System-wide constants and hardware-specific values.

pub mod devices;
pub mod memory;
pub mod processes;
