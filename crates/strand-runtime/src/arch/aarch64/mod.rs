//! aarch64 context switching
//!
//! Mirrors the x86_64 scheme: record a resume address, swap stacks, and
//! branch. AAPCS64 callee-saved set: x19-x28, fp, lr, d8-d15.

use std::arch::naked_asm;
use strand_core::Context;

/// Initialize a fiber's launch context
///
/// # Safety
///
/// `ctx` must point to valid `Context` memory. `stack_top` must be the
/// upper end of a mapped stack region.
#[inline]
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // sp must stay 16-byte aligned at all times on aarch64
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    *ctx = Context::default();
    ctx.sp = sp as u64;
    ctx.pc = launch_trampoline as usize as u64;
    ctx.x19_28[0] = entry_fn as u64;
    ctx.x19_28[1] = entry_arg as u64;
}

/// Trampoline that calls the entry function with its argument
///
/// x19 = entry function, x20 = argument, loaded by the first switch-in.
#[unsafe(naked)]
pub unsafe extern "C" fn launch_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "bl {finished}",
        "brk #0",
        finished = sym crate::sched::fiber_finished,
    );
}

/// Voluntary context switch
///
/// Saves the callee-saved set into `old` (x0), restores `new` (x1) and
/// branches to its recorded resume address.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save to old (x0)
        "mov x2, sp",
        "str x2, [x0, #0x00]",
        "adr x2, 1f",
        "str x2, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "stp x29, x30, [x0, #0x60]",
        "stp d8,  d9,  [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xA0]",
        // Load from new (x1)
        "ldr x2, [x1, #0x00]",
        "mov sp, x2",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldp x29, x30, [x1, #0x60]",
        "ldp d8,  d9,  [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xA0]",
        "ldr x2, [x1, #0x08]",
        "br x2",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
