//! x86_64 context switching
//!
//! Inline naked assembly, stable since Rust 1.88.

use std::arch::naked_asm;
use strand_core::Context;

/// Initialize a fiber's launch context
///
/// Sets up the register block so the first switch-in begins execution at
/// the entry trampoline with `entry_fn`/`entry_arg` in callee-saved
/// registers.
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
    // Stack must be 16-byte aligned per System V AMD64 ABI; the extra -8
    // mimics the push of a return address so the trampoline's `call`
    // lands on a 16-byte boundary.
    let sp = stack_top as usize;
    let aligned_sp = (sp & !0xF) - 8;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = launch_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry function with its argument
///
/// Runs on the fiber's own stack. When the entry returns, control passes
/// to the scheduler's finish handler, which never comes back here.
#[unsafe(naked)]
pub unsafe extern "C" fn launch_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {finished}",
        "ud2",
        finished = sym crate::sched::fiber_finished,
    );
}

/// Voluntary context switch
///
/// Saves callee-saved registers into `old`, loads `new`, and continues
/// at the resume point recorded in `new`. Returns when something later
/// switches back into `old`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_old: *mut Context, _new: *const Context) {
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
        // Load from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the resume point
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
