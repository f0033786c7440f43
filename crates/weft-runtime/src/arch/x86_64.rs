//! x86_64 context switching
//!
//! naked_asm implementation, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register snapshot for a suspended fiber.
///
/// Field order is the layout the assembly in `switch_context` reads
/// and writes; do not reorder.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SavedContext {
    pub sp: u64,
    pub ip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SavedContext {
    pub const fn zeroed() -> Self {
        SavedContext {
            sp: 0,
            ip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare a fresh context so that switching to it enters
/// `entry(arg)` on the given stack.
///
/// # Safety
///
/// `ctx` must point to writable `SavedContext` memory and `stack_top`
/// to the high end of a mapped stack. `entry` must be an
/// `extern "C" fn(usize)` address; it must never return.
pub unsafe fn init_context(ctx: *mut SavedContext, stack_top: *mut u8, entry: usize, arg: usize) {
    // 16-byte alignment per the System V AMD64 ABI; the trampoline's
    // own `call` pushes the return address that leaves the entry at
    // the ABI-required rsp ≡ 8 (mod 16)
    let sp = stack_top as usize & !0xF;

    let ctx = &mut *ctx;
    ctx.sp = sp as u64;
    ctx.ip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as u64;
    ctx.r13 = arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First frame of every fiber: moves the argument into place and
/// calls the entry. The entry diverges through a final context
/// switch, so control never comes back here.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2",);
}

/// Save the current callee-saved registers into `_save` and load
/// `_load`, transferring control to its saved instruction pointer.
///
/// Returns (to the saved return point in `_save`) when some other
/// context switches back.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut SavedContext, _load: *const SavedContext) {
    naked_asm!(
        // Save callee-saved registers into *rdi
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load the target context from *rsi
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
