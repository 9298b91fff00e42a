//! Raw x86-64 context switch and the thread-entry trampoline.
//!
//! `context_switch` reads and writes the saved-stack-pointer field of a
//! [`crate::sched::thread::Tcb`] at a fixed byte offset. [`RSP_OFFSET`] is
//! computed with `core::mem::offset_of!` and substituted directly into the
//! naked routine's `mov [rdi + N]` / `mov rsp, [rsi + N]` operands below, so
//! a field reorder in `Tcb` can never desynchronize the two; a compile-time
//! assertion additionally pins the offset to be 8-byte aligned, which the
//! raw quadword `mov` the routine performs requires.

use core::arch::naked_asm;

use crate::sched::thread::Tcb;

/// Byte offset of `Tcb::rsp` within the struct. Kept here (rather than
/// computed inline) because the naked routine below encodes it directly
/// into `mov [rdi + N]` / `mov rsp, [rsi + N]`.
pub const RSP_OFFSET: usize = core::mem::offset_of!(Tcb, rsp);

const _: () = assert!(RSP_OFFSET % 8 == 0, "Tcb::rsp must be 8-byte aligned for context_switch's quadword mov");

/// Switches from `old`'s context to `new`'s context.
///
/// Saves callee-saved registers and RFLAGS onto the current stack, stores
/// the resulting RSP into `old.rsp`, loads RSP from `new.rsp`, restores
/// registers, and returns into whatever `new`'s stack was set up to return
/// into — either a previous call to `context_switch` (for an already-run
/// thread) or [`thread_entry_trampoline`] (for a thread's first run).
///
/// # Safety
///
/// `old` and `new` must be valid, live `Tcb`s; `new.rsp` must point at a
/// stack image shaped like the one this function itself produces (or the
/// initial image built by `sched::thread::Tcb::new`).
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut Tcb, new: *mut Tcb) {
    naked_asm!(
        "pushfq",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi + {rsp_offset}], rsp",
        "mov rsp, [rsi + {rsp_offset}]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "popfq",
        "sti",
        "ret",
        rsp_offset = const RSP_OFFSET,
    );
}

/// Entry point the very first `context_switch` into a freshly created
/// thread returns into. Never returns itself (falls through to thread
/// exit).
///
/// # Safety
///
/// Must only ever be reached via `ret` from [`context_switch`], with the
/// current thread's TCB pointer retrievable from `sched::current()`.
pub unsafe extern "C" fn thread_entry_trampoline() -> ! {
    // Interrupts are already enabled here: `context_switch`'s `sti` runs
    // before the `ret` that lands us at this function.
    let (entry, arg) = crate::sched::scheduler::current_entry_and_arg();
    let code = entry(arg);
    crate::sched::scheduler::exit_current(code);
}
