#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]

#[cfg(test)]
extern crate alloc;

pub mod arch;
pub mod constants;
pub mod devices;
pub mod init;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod processes;

#[cfg(test)]
mod testing;

pub use devices::serial;
pub use kernel::{Kernel, KernelError};

pub mod prelude {
    pub use crate::debug_println;
    pub use crate::serial_print;
    pub use crate::serial_println;
    pub use crate::vga_print;
    pub use crate::vga_println;
}

#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_println!($($arg)*);
    }
}
