//! x86_64 context switching (System V AMD64 ABI)

use super::EntryFn;
use std::arch::naked_asm;

/// Default MXCSR: all exceptions masked, round-to-nearest
const MXCSR_DEFAULT: u32 = 0x1F80;

/// Default x87 control word: extended precision, all exceptions masked
const FPUCW_DEFAULT: u32 = 0x037F;

/// Saved registers of a suspended context
///
/// Only callee-saved state is kept: everything else was already spilled by
/// the compiler around the `context_switch` call.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Registers {
    pub rsp: u64,   // 0x00
    pub rip: u64,   // 0x08
    pub rbx: u64,   // 0x10
    pub rbp: u64,   // 0x18
    pub r12: u64,   // 0x20
    pub r13: u64,   // 0x28
    pub r14: u64,   // 0x30
    pub r15: u64,   // 0x38
    pub mxcsr: u32, // 0x40
    pub fpucw: u32, // 0x44
}

/// Initialize a context so that switching to it calls `entry(arg)` on `stack_top`.
///
/// # Safety
///
/// `regs` must be valid for writes and `stack_top` must be the upper end of
/// a mapped, writable stack that outlives the context.
#[inline]
pub unsafe fn init_context(regs: *mut Registers, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline is entered by `jmp`, so rsp must already be 16-byte
    // aligned for its own `call`.
    let sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    *regs = Registers::default();
    regs.rsp = sp as u64;
    regs.rip = fiber_entry_trampoline as usize as u64;
    regs.r12 = entry as usize as u64;
    regs.r13 = arg as u64;
    regs.mxcsr = MXCSR_DEFAULT;
    regs.fpucw = FPUCW_DEFAULT;
}

/// First code run on a new stack: `entry(arg)`, which never returns.
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the current context into `old` and resume `new`.
///
/// Returns when some other context switches back into `old`.
///
/// # Safety
///
/// Both pointers must be valid; `new` must hold a context produced by
/// `init_context` or by an earlier `context_switch`.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Registers, _new: *const Registers) {
    naked_asm!(
        // Save callee-saved registers to old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr [rdi + 0x40]",
        "fnstcw [rdi + 0x44]",
        // Load from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr [rsi + 0x40]",
        "fldcw [rsi + 0x44]",
        "jmp rax",
        // Resume point of a saved context
        "1:",
        "ret",
    );
}
