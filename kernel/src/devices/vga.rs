//! VGA text mode console (80x25).
//!
//! Used for boot narration only. Each cell is a 16-bit value, attribute in
//! the high byte and code point in the low byte. Writes wrap at the last
//! column and scroll the screen up once the cursor leaves the last row.

use core::{fmt, ptr};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::constants::devices::{VGA_BUFFER_ADDR, VGA_HEIGHT, VGA_WIDTH, WHITE_ON_BLACK};

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

#[inline]
fn cell(byte: u8) -> u16 {
    (WHITE_ON_BLACK as u16) << 8 | byte as u16
}

pub struct VgaWriter {
    buffer: *mut u16,
    row: usize,
    col: usize,
}

// SAFETY: the writer is the only user of its buffer and sits behind a lock
unsafe impl Send for VgaWriter {}

impl VgaWriter {
    /// # Safety
    ///
    /// `buffer` must point at `VGA_WIDTH * VGA_HEIGHT` writable cells used by
    /// nothing else for the lifetime of the writer.
    pub const unsafe fn new(buffer: *mut u16) -> Self {
        VgaWriter {
            buffer,
            row: 0,
            col: 0,
        }
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    fn write_cell(&mut self, index: usize, value: u16) {
        unsafe { ptr::write_volatile(self.buffer.add(index), value) };
    }

    fn read_cell(&self, index: usize) -> u16 {
        unsafe { ptr::read_volatile(self.buffer.add(index)) }
    }

    pub fn clear_screen(&mut self) {
        for index in 0..VGA_WIDTH * VGA_HEIGHT {
            self.write_cell(index, 0);
        }
        self.row = 0;
        self.col = 0;
    }

    pub fn write_byte(&mut self, byte: u8) {
        if byte == b'\n' {
            self.new_line();
            return;
        }

        self.write_cell(self.row * VGA_WIDTH + self.col, cell(byte));
        self.col += 1;
        if self.col >= VGA_WIDTH {
            self.new_line();
        }
    }

    pub fn print(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7e | b'\n' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
    }

    /// Prints `value` as `0x` followed by eight upper-case hex digits.
    pub fn print_hex(&mut self, value: u32) {
        let mut text = *b"0x00000000";
        for (i, digit) in text[2..].iter_mut().rev().enumerate() {
            *digit = HEX_DIGITS[((value >> (i * 4)) & 0xF) as usize];
        }
        for byte in text {
            self.write_byte(byte);
        }
    }

    fn new_line(&mut self) {
        self.col = 0;
        self.row += 1;
        if self.row >= VGA_HEIGHT {
            self.scroll();
            self.row = VGA_HEIGHT - 1;
        }
    }

    fn scroll(&mut self) {
        for index in VGA_WIDTH..VGA_WIDTH * VGA_HEIGHT {
            let value = self.read_cell(index);
            self.write_cell(index - VGA_WIDTH, value);
        }
        for col in 0..VGA_WIDTH {
            self.write_cell((VGA_HEIGHT - 1) * VGA_WIDTH + col, 0);
        }
    }
}

impl fmt::Write for VgaWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.print(s);
        Ok(())
    }
}

lazy_static! {
    /// Writer over the memory-mapped text buffer.
    pub static ref WRITER: Mutex<VgaWriter> =
        Mutex::new(unsafe { VgaWriter::new(VGA_BUFFER_ADDR as *mut u16) });
}

pub fn print(s: &str) {
    WRITER.lock().print(s);
}

pub fn print_hex(value: u32) {
    WRITER.lock().print_hex(value);
}

pub fn clear_screen() {
    WRITER.lock().clear_screen();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = WRITER.lock().write_fmt(args);
}

/// Prints formatted text on the screen.
#[macro_export]
macro_rules! vga_print {
    ($($arg:tt)*) => {
        $crate::devices::vga::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! vga_println {
    () => ($crate::vga_print!("\n"));
    ($($arg:tt)*) => ($crate::vga_print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{vec, vec::Vec};
    use core::fmt::Write;

    fn screen() -> Vec<u16> {
        vec![0xAAAA; VGA_WIDTH * VGA_HEIGHT]
    }

    fn text(buffer: &[u16], row: usize, len: usize) -> Vec<u8> {
        buffer[row * VGA_WIDTH..row * VGA_WIDTH + len]
            .iter()
            .map(|&c| c as u8)
            .collect()
    }

    #[test]
    fn test_print_writes_cells_with_attribute() {
        let mut buffer = screen();
        let mut writer = unsafe { VgaWriter::new(buffer.as_mut_ptr()) };
        writer.print("OS");

        assert_eq!(buffer[0], 0x0f00 | b'O' as u16);
        assert_eq!(buffer[1], 0x0f00 | b'S' as u16);
        assert_eq!(writer.cursor(), (0, 2));
    }

    #[test]
    fn test_newline_resets_column() {
        let mut buffer = screen();
        let mut writer = unsafe { VgaWriter::new(buffer.as_mut_ptr()) };
        writer.print("ab\ncd");

        assert_eq!(writer.cursor(), (1, 2));
        assert_eq!(text(&buffer, 1, 2), b"cd");
    }

    #[test]
    fn test_wraps_at_last_column() {
        let mut buffer = screen();
        let mut writer = unsafe { VgaWriter::new(buffer.as_mut_ptr()) };
        for _ in 0..VGA_WIDTH {
            writer.write_byte(b'x');
        }
        assert_eq!(writer.cursor(), (1, 0));
        writer.write_byte(b'y');
        assert_eq!(text(&buffer, 1, 1), b"y");
    }

    #[test]
    fn test_scrolls_past_last_row() {
        let mut buffer = screen();
        let mut writer = unsafe { VgaWriter::new(buffer.as_mut_ptr()) };
        writer.clear_screen();
        writer.print("first\n");
        for _ in 1..VGA_HEIGHT {
            writer.print("line\n");
        }

        assert_eq!(writer.cursor(), (VGA_HEIGHT - 1, 0));
        // "first" scrolled off, last row blank
        assert_eq!(text(&buffer, 0, 4), b"line");
        assert!(buffer[(VGA_HEIGHT - 1) * VGA_WIDTH..].iter().all(|&c| c == 0));
    }

    #[test]
    fn test_print_hex() {
        let mut buffer = screen();
        let mut writer = unsafe { VgaWriter::new(buffer.as_mut_ptr()) };
        writer.print_hex(0x00C0_FFEE);
        assert_eq!(text(&buffer, 0, 10), b"0x00C0FFEE");
    }

    #[test]
    fn test_clear_screen_and_fmt() {
        let mut buffer = screen();
        let mut writer = unsafe { VgaWriter::new(buffer.as_mut_ptr()) };
        writer.clear_screen();
        assert!(buffer.iter().all(|&c| c == 0));

        write!(writer, "pid {}", 7).unwrap();
        assert_eq!(text(&buffer, 0, 5), b"pid 7");
    }

    #[test]
    fn test_unprintable_bytes_are_replaced() {
        let mut buffer = screen();
        let mut writer = unsafe { VgaWriter::new(buffer.as_mut_ptr()) };
        writer.print("é");
        assert_eq!(text(&buffer, 0, 2), [0xfe, 0xfe]);
    }
}
