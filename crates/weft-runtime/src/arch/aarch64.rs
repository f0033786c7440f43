//! aarch64 context switching
//!
//! naked_asm implementation mirroring the x86_64 module: x19-x28,
//! fp (x29) and lr (x30) are callee-saved under AAPCS64, plus the
//! stack pointer and a resume address.

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
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub fp: u64,
    pub lr: u64,
}

impl SavedContext {
    pub const fn zeroed() -> Self {
        SavedContext {
            sp: 0,
            ip: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            fp: 0,
            lr: 0,
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
    // 16-byte alignment per AAPCS64
    let sp = stack_top as usize & !0xF;

    let ctx = &mut *ctx;
    *ctx = SavedContext::zeroed();
    ctx.sp = sp as u64;
    ctx.ip = entry_trampoline as usize as u64;
    ctx.x19 = entry as u64;
    ctx.x20 = arg as u64;
}

/// First frame of every fiber: moves the argument into place and
/// calls the entry. The entry diverges through a final context
/// switch, so control never comes back here.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov x0, x20", "blr x19", "brk #1",);
}

/// Save the current callee-saved registers into `_save` and load
/// `_load`, transferring control to its saved instruction pointer.
///
/// Returns (to the saved return point in `_save`) when some other
/// context switches back.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut SavedContext, _load: *const SavedContext) {
    naked_asm!(
        // Save callee-saved registers into *x0
        "mov x2, sp",
        "str x2, [x0, 0x00]",
        "adr x3, 1f",
        "str x3, [x0, 0x08]",
        "stp x19, x20, [x0, 0x10]",
        "stp x21, x22, [x0, 0x20]",
        "stp x23, x24, [x0, 0x30]",
        "stp x25, x26, [x0, 0x40]",
        "stp x27, x28, [x0, 0x50]",
        "stp x29, x30, [x0, 0x60]",
        // Load the target context from *x1
        "ldr x2, [x1, 0x00]",
        "mov sp, x2",
        "ldr x3, [x1, 0x08]",
        "ldp x19, x20, [x1, 0x10]",
        "ldp x21, x22, [x1, 0x20]",
        "ldp x23, x24, [x1, 0x30]",
        "ldp x25, x26, [x1, 0x40]",
        "ldp x27, x28, [x1, 0x50]",
        "ldp x29, x30, [x1, 0x60]",
        "br x3",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
