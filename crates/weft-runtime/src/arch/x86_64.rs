//! x86_64 context switching
//!
//! Voluntary switches only need the System V callee-saved set plus the
//! stack and instruction pointers. Inline naked assembly, stable since
//! Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register file of a suspended fiber.
///
/// Field order is load-bearing: the assembly below addresses the struct
/// by fixed offsets.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct SavedContext {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedContext {
    pub const fn zeroed() -> Self {
        SavedContext {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prime `ctx` so the first switch into it enters the trampoline, which
/// calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `ctx` must point to writable `SavedContext` memory and `stack_top` must
/// be the top of a live stack mapping.
pub unsafe fn init_context(
    ctx: *mut SavedContext,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // The trampoline is jumped to, not called, so the stack pointer must
    // be 16-byte aligned when it issues its own `call` (SysV AMD64 ABI).
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First frame of every fiber: calls the staged entry function with its
/// staged argument. The entry function completes the fiber and switches
/// away; control never comes back here.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the current callee-saved register file into `old`, load `new`,
/// and continue at its saved instruction pointer.
///
/// # Safety
///
/// `old` must be writable, `new` must hold a context previously produced
/// by `init_context` or a prior save. The two must not alias.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut SavedContext, _new: *const SavedContext) {
    naked_asm!(
        // Save into old (RDI)
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
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
