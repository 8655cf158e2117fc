//! Saved CPU state of a process.
//!
//! The layout is shared with the assembly in `arch::x86` and must not change:
//! eleven 32-bit words, `eax` at offset 0 through `cr3` at offset 40.

use core::{fmt, mem};

#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CpuContext {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cr3: u32,
}

const _: () = {
    assert!(mem::size_of::<CpuContext>() == 44);
    assert!(mem::offset_of!(CpuContext, eax) == 0);
    assert!(mem::offset_of!(CpuContext, ebp) == 24);
    assert!(mem::offset_of!(CpuContext, esp) == 28);
    assert!(mem::offset_of!(CpuContext, eip) == 32);
    assert!(mem::offset_of!(CpuContext, eflags) == 36);
    assert!(mem::offset_of!(CpuContext, cr3) == 40);
};

impl CpuContext {
    pub const fn zero() -> Self {
        Self {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: 0,
            eip: 0,
            eflags: 0,
            cr3: 0,
        }
    }

    /// Context that starts executing at `entry` on an empty stack whose top is
    /// `stack_top`, in the address space rooted at `cr3`.
    pub fn initial(entry: u32, stack_top: u32, eflags: u32, cr3: u32) -> Self {
        Self {
            esp: stack_top,
            eip: entry,
            eflags,
            cr3,
            ..Self::zero()
        }
    }
}

impl fmt::Debug for CpuContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ds = f.debug_struct("CpuContext");

        ds.field("eax", &format_args!("{:#010x}", self.eax))
            .field("ebx", &format_args!("{:#010x}", self.ebx))
            .field("ecx", &format_args!("{:#010x}", self.ecx))
            .field("edx", &format_args!("{:#010x}", self.edx))
            .field("esi", &format_args!("{:#010x}", self.esi))
            .field("edi", &format_args!("{:#010x}", self.edi))
            .field("ebp", &format_args!("{:#010x}", self.ebp))
            .field("esp", &format_args!("{:#010x}", self.esp))
            .field("eip", &format_args!("{:#010x}", self.eip))
            .field("eflags", &format_args!("{:#010x}", self.eflags))
            .field("cr3", &format_args!("{:#010x}", self.cr3));

        ds.finish()
    }
}

/// Raw operands for the switch primitive.
///
/// * `save`: where the running state goes, `None` on the very first entry
/// * `load`: the state to resume
///
/// Both point into the process table, which must stay in place until the
/// switch has happened.
#[derive(Debug, Clone, Copy)]
pub struct ContextSwitch {
    pub save: Option<*mut CpuContext>,
    pub load: *const CpuContext,
}
