//! 32-bit x86 primitives: control registers, the context switch and the
//! kernel singleton the running units share.
//!
//! `switch_context(old, new)` stores the caller's registers into `old` so
//! that resuming `old` looks like `switch_context` returning, then loads
//! `new`. `enter_context(new)` only loads. Loading switches CR3 when it
//! differs, moves to the saved stack, pushes `eip` and `eflags` on it, and
//! finishes with `popfd; ret`. Offsets match `CpuContext`.

use core::arch::{asm, global_asm};

use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use super::Mmu;
use crate::{
    constants::devices::{PIC1_DATA, PIC2_DATA},
    init,
    kernel::{Kernel, KernelError},
    memory::{physical::IdentityMapped, MemoryLayout},
    processes::{ContextSwitch, CpuContext},
};

global_asm!(
    ".global cooper_switch_context",
    ".global cooper_enter_context",
    "cooper_switch_context:",
    "    mov eax, [esp + 4]",
    "    mov dword ptr [eax + 0], 0",
    "    mov [eax + 4], ebx",
    "    mov [eax + 8], ecx",
    "    mov [eax + 12], edx",
    "    mov [eax + 16], esi",
    "    mov [eax + 20], edi",
    "    mov [eax + 24], ebp",
    "    lea ecx, [esp + 4]",
    "    mov [eax + 28], ecx",
    "    mov ecx, [esp]",
    "    mov [eax + 32], ecx",
    "    pushfd",
    "    pop ecx",
    "    mov [eax + 36], ecx",
    "    mov ecx, cr3",
    "    mov [eax + 40], ecx",
    "    mov edx, [esp + 8]",
    "    jmp cooper_load_context",
    "cooper_enter_context:",
    "    mov edx, [esp + 4]",
    "cooper_load_context:",
    "    mov eax, [edx + 40]",
    "    mov ecx, cr3",
    "    cmp eax, ecx",
    "    je cooper_same_space",
    "    mov cr3, eax",
    "cooper_same_space:",
    "    mov esp, [edx + 28]",
    "    push dword ptr [edx + 32]",
    "    push dword ptr [edx + 36]",
    "    mov eax, [edx + 0]",
    "    mov ebx, [edx + 4]",
    "    mov ecx, [edx + 8]",
    "    mov esi, [edx + 16]",
    "    mov edi, [edx + 20]",
    "    mov ebp, [edx + 24]",
    "    mov edx, [edx + 12]",
    "    popfd",
    "    ret",
);

extern "C" {
    fn cooper_switch_context(old: *mut CpuContext, new: *const CpuContext);
    fn cooper_enter_context(new: *const CpuContext) -> !;
}

/// The MMU of the running CPU.
#[derive(Debug, Default)]
pub struct X86Mmu;

impl Mmu for X86Mmu {
    fn load_directory(&mut self, directory: PhysAddr) {
        unsafe {
            asm!("mov cr3, {}", in(reg) directory.as_u64() as u32, options(nostack, preserves_flags));
        }
    }

    fn enable_paging(&mut self) {
        unsafe {
            asm!(
                "mov {tmp}, cr0",
                "or {tmp}, 0x80000000",
                "mov cr0, {tmp}",
                tmp = out(reg) _,
                options(nostack)
            );
        }
    }

    fn invalidate_page(&mut self, page: VirtAddr) {
        unsafe {
            asm!("invlpg [{}]", in(reg) page.as_u64() as u32, options(nostack, preserves_flags));
        }
    }
}

impl ContextSwitch {
    /// Carries out the switch. With nothing to save this never returns.
    ///
    /// # Safety
    ///
    /// Both pointers must still refer to live contexts in the process table,
    /// and `load` must describe a runnable stack, entry point and directory.
    pub unsafe fn execute(self) {
        match self.save {
            Some(old) => cooper_switch_context(old, self.load),
            None => cooper_enter_context(self.load),
        }
    }
}

pub type HardwareKernel = Kernel<IdentityMapped, X86Mmu>;

/// The one kernel instance. Never held across a context switch.
pub static KERNEL: Mutex<Option<HardwareKernel>> = Mutex::new(None);

/// Brings up the kernel singleton, creates one unit per entry point and
/// returns the switch into the first of them.
pub fn boot(layout: MemoryLayout, entries: &[VirtAddr]) -> Result<ContextSwitch, KernelError> {
    // units run with IF set but no interrupt handlers exist
    mask_legacy_pic();

    let mut guard = KERNEL.lock();
    let kernel = guard.insert(Kernel::with_layout(IdentityMapped, layout, X86Mmu)?);

    init::spawn_workloads(kernel, entries);
    let transfer = init::start(kernel)?;
    kernel
        .context_switch(transfer)
        .ok_or(KernelError::NothingToRun)
}

/// Gives the CPU to the next ready unit. Returns once this unit is picked
/// again, or right away when nobody else is ready.
pub fn yield_now() {
    let switch = {
        let mut guard = KERNEL.lock();
        let Some(kernel) = guard.as_mut() else {
            return;
        };
        kernel
            .yield_now()
            .and_then(|transfer| kernel.context_switch(transfer))
    };

    if let Some(switch) = switch {
        // SAFETY: the contexts live in the static kernel and the lock is free
        unsafe { switch.execute() };
    }
}

/// Terminates the running unit and moves on. Idles if nothing is left.
pub fn exit() -> ! {
    {
        let mut guard = KERNEL.lock();
        if let Some(kernel) = guard.as_mut() {
            if let Some(current) = kernel.current() {
                kernel.terminate(current);
            }
        }
    }
    yield_now();
    idle_loop()
}

/// Masks every line of both 8259 PICs.
fn mask_legacy_pic() {
    unsafe {
        asm!("out dx, al", in("dx") PIC1_DATA, in("al") 0xFFu8, options(nomem, nostack, preserves_flags));
        asm!("out dx, al", in("dx") PIC2_DATA, in("al") 0xFFu8, options(nomem, nostack, preserves_flags));
    }
}

#[inline(always)]
pub fn halt() {
    unsafe {
        asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

pub fn idle_loop() -> ! {
    loop {
        halt();
    }
}

/// Stops the CPU for good.
pub fn halt_forever() -> ! {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
    idle_loop()
}
