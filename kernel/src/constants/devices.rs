//! Console device configuration.

/// I/O port of the serial console (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;

/// Physical address of the VGA text buffer.
pub const VGA_BUFFER_ADDR: usize = 0xb8000;
pub const VGA_WIDTH: usize = 80;
pub const VGA_HEIGHT: usize = 25;

/// Attribute byte for white on black.
pub const WHITE_ON_BLACK: u8 = 0x0f;

/// Data ports of the master and slave 8259 PICs.
pub const PIC1_DATA: u16 = 0x21;
pub const PIC2_DATA: u16 = 0xA1;
