//! Console devices: the COM1 serial port for logs and panics, and the VGA
//! text buffer for boot narration.

pub mod serial;
pub mod vga;
