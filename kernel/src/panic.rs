//! Panic handler for the real kernel target.
//!
//! Host test builds keep `std`'s own panic machinery (needed for `#[should_panic]`
//! and test-harness unwinding), so this is only compiled outside `cfg(test)`.

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::kfatal!("panic: {}", info);
    loop {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: `cli; hlt` only parks the CPU; nothing resumes after a panic.
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack))
        };
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        core::hint::spin_loop();
    }
}
