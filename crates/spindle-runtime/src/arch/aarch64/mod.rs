//! aarch64 context switching (AAPCS64)
//!
//! Saves x19-x30, sp and the low halves of v8-v15.

use super::EntryFn;
use std::arch::naked_asm;

/// Saved callee-saved registers
///
/// Field offsets are hard-coded in `context_switch`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub sp: u64,       // 0x00
    pub pc: u64,       // 0x08
    pub x19_x28: [u64; 10], // 0x10..0x60
    pub fp: u64,       // 0x60
    pub lr: u64,       // 0x68
    pub d8_d15: [u64; 8], // 0x70..0xb0
}

/// Prepare `ctx` so that switching to it runs `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the upper end of a writable stack that outlives
/// every use of `ctx`.
#[inline]
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = (stack_top as usize) & !0xF;

    let mut regs = [0u64; 10];
    regs[0] = entry as *const () as usize as u64; // x19
    regs[1] = arg as u64; // x20

    *ctx = Context {
        sp: sp as u64,
        pc: fiber_entry_trampoline as *const () as usize as u64,
        x19_x28: regs,
        ..Context::default()
    };
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov x29, xzr",
        "mov x30, xzr",
        "mov x0, x20",
        "blr x19",
        "brk #0x1",
    );
}

/// Save the running context into `old` and resume `new`.
///
/// # Safety
///
/// `new` must hold a context produced by `init_context` or by a previous
/// `context_switch`, and its stack must still be mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save into old (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "adr x9, 1f",
        "str x9, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "stp x29, x30, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        // Load from new (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldp x29, x30, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xa0]",
        "ldr x9, [x1, #0x08]",
        "br x9",
        // Resumed here by a later switch back to `old`
        "1:",
        "ret",
    );
}
