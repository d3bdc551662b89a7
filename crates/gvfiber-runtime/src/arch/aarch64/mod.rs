//! aarch64 context switching (AAPCS64)

use super::EntryFn;
use std::arch::naked_asm;

/// Saved registers of a suspended context
///
/// x19-x29, the link register, sp and the low halves of v8-v15.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Registers {
    pub sp: u64,       // 0x00
    pub lr: u64,       // 0x08
    pub x19: u64,      // 0x10
    pub x20: u64,      // 0x18
    pub x21: u64,      // 0x20
    pub x22: u64,      // 0x28
    pub x23: u64,      // 0x30
    pub x24: u64,      // 0x38
    pub x25: u64,      // 0x40
    pub x26: u64,      // 0x48
    pub x27: u64,      // 0x50
    pub x28: u64,      // 0x58
    pub fp: u64,       // 0x60
    pub d: [u64; 8],   // 0x68..0xA8
}

/// Initialize a context so that switching to it calls `entry(arg)` on `stack_top`.
///
/// # Safety
///
/// `regs` must be valid for writes and `stack_top` must be the upper end of
/// a mapped, writable stack that outlives the context.
#[inline]
pub unsafe fn init_context(regs: *mut Registers, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    *regs = Registers::default();
    regs.sp = sp as u64;
    regs.lr = fiber_entry_trampoline as usize as u64;
    regs.x19 = entry as usize as u64;
    regs.x20 = arg as u64;
}

/// First code run on a new stack: `entry(arg)`, which never returns.
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #0",
    );
}

/// Save the current context into `old` and resume `new`.
///
/// # Safety
///
/// Both pointers must be valid; `new` must hold a context produced by
/// `init_context` or by an earlier `context_switch`.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Registers, _new: *const Registers) {
    naked_asm!(
        // Save into old (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "str x30, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "str x29, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from new (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldr x30, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldr x29, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}
