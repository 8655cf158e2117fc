#![no_std]
#![no_main]

use core::{arch::global_asm, ptr};

use cooper::{
    arch::x86::{self, halt_forever, KERNEL},
    constants::memory::FRAME_SIZE,
    devices::vga,
    logging,
    memory::MemoryLayout,
    prelude::*,
};
use log::info;
use x86_64::VirtAddr;

// Multiboot v1 header (page-aligned modules, memory info), a 16 KiB boot
// stack and the entry point the loader jumps to in protected mode.
global_asm!(
    ".section .multiboot, \"a\"",
    ".align 4",
    ".long 0x1BADB002",
    ".long 0x00000003",
    ".long -(0x1BADB002 + 0x00000003)",
    ".section .bss",
    ".align 16",
    "boot_stack_bottom:",
    ".skip 16384",
    "boot_stack_top:",
    ".section .text",
    ".global _start",
    "_start:",
    "    mov esp, offset boot_stack_top",
    "    call kernel_main",
    "cooper_hang:",
    "    cli",
    "    hlt",
    "    jmp cooper_hang",
);

extern "C" {
    /// End of the kernel image, from the linker script.
    static _kernel_end: u8;
}

const WORK_SPIN: u32 = 10_000_000;

/// First address after the kernel image, rounded up to a page.
fn kernel_end() -> usize {
    let end = unsafe { ptr::addr_of!(_kernel_end) } as usize;
    end.div_ceil(FRAME_SIZE) * FRAME_SIZE
}

fn run_worker(name: &str) -> ! {
    let mut count: u32 = 0;
    loop {
        count = count.wrapping_add(1);
        for _ in 0..WORK_SPIN {
            core::hint::spin_loop();
        }
        info!("{} finished round {}", name, count);
        x86::yield_now();
    }
}

extern "C" fn process1() -> ! {
    run_worker("process 1")
}

extern "C" fn process2() -> ! {
    run_worker("process 2")
}

extern "C" fn process3() -> ! {
    run_worker("process 3")
}

/// Runs a few rounds, then terminates itself.
extern "C" fn short_lived() -> ! {
    for round in 1..=3 {
        info!("short-lived process round {}", round);
        x86::yield_now();
    }
    info!("short-lived process exiting");
    x86::exit()
}

#[no_mangle]
extern "C" fn kernel_main() -> ! {
    vga::clear_screen();
    logging::init();

    vga::print("OS Booting...\n");
    vga::print("Initializing memory virtualization...\n");

    let layout = MemoryLayout {
        placement_start: kernel_end(),
        ..MemoryLayout::default()
    };
    debug_println!("placement memory starts at {:#x}", layout.placement_start);

    let entries = [
        process1 as extern "C" fn() -> !,
        process2,
        process3,
        short_lived,
    ]
    .map(|entry| VirtAddr::new(entry as usize as u64));

    match x86::boot(layout, &entries) {
        Ok(switch) => {
            if let Some(kernel) = KERNEL.lock().as_ref() {
                vga::print("Paging enabled, kernel directory at ");
                if let Some(directory) = kernel.memory().kernel_directory() {
                    vga::print_hex(directory.physical_address().as_u64() as u32);
                }
                vga_println!();
                vga_println!("{} processes created", kernel.processes().iter_live().count());
            }
            vga::print("Starting scheduler...\n");

            // SAFETY: the contexts live in KERNEL, whose lock is released
            unsafe { switch.execute() };
        }
        Err(err) => {
            vga_println!("Kernel panic: {}", err);
            serial_println!("Kernel panic: {}", err);
        }
    }

    halt_forever()
}

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    halt_forever()
}
