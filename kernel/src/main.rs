//! Kernel image entry point.
//!
//! Thin binary wrapping [`ember_kernel`]: the linker script's
//! `ENTRY(kernel_entry)` lands here directly from the loader, with no crt0
//! to run first, so this hands off to [`ember_kernel::boot::entry`]
//! immediately. Nothing here installs a log sink: the debug-serial port
//! driver that would back [`ember_kernel::log`] is an external collaborator
//! outside this kernel's scope, so `kinfo!`/`kfatal!` and friends are
//! discarded until one is wired in.

#![no_std]
#![no_main]

/// Real entry point, referenced by `ENTRY(kernel_entry)` in the linker
/// script. Limine jumps here directly; there is no runtime (crt0, libc) to
/// set up first.
#[no_mangle]
pub extern "C" fn kernel_entry() -> ! {
    ember_kernel::boot::entry();
}
