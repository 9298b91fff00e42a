//! Exception handler bodies and the hardware-IRQ dispatch table.

/// CPU-pushed frame for every `extern "x86-interrupt"` handler.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptStackFrame {
    pub instruction_pointer: u64,
    pub code_segment: u64,
    pub cpu_flags: u64,
    pub stack_pointer: u64,
    pub stack_segment: u64,
}

/// Page-fault error-code bits (Intel SDM vol. 3, "Page-Fault Exception
/// Error Code").
pub mod pf_error {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const RESERVED: u64 = 1 << 3;
    pub const INSTRUCTION_FETCH: u64 = 1 << 4;
}

/// Exception handler bodies (vectors 0-31).
pub mod handlers {
    use super::InterruptStackFrame;

    fn halt_loop() -> ! {
        loop {
            // SAFETY: `hlt` only pauses the CPU until the next interrupt,
            // and we never return control to whoever called into here.
            unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
        }
    }

    macro_rules! diagnostic_handler {
        ($name:ident, $msg:literal) => {
            pub extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
                crate::kfatal!(
                    "exception: {} at rip={:#x}",
                    $msg,
                    { frame.instruction_pointer }
                );
                halt_loop();
            }
        };
    }

    macro_rules! diagnostic_handler_err {
        ($name:ident, $msg:literal) => {
            pub extern "x86-interrupt" fn $name(frame: InterruptStackFrame, error_code: u64) {
                crate::kfatal!(
                    "exception: {} (code={:#x}) at rip={:#x}",
                    $msg,
                    error_code,
                    { frame.instruction_pointer }
                );
                halt_loop();
            }
        };
    }

    diagnostic_handler!(divide_error, "divide error");
    diagnostic_handler!(debug, "debug");
    diagnostic_handler!(nmi, "non-maskable interrupt");

    pub extern "x86-interrupt" fn breakpoint(frame: InterruptStackFrame) {
        crate::kdebug!("breakpoint at rip={:#x}", { frame.instruction_pointer });
    }

    diagnostic_handler!(overflow, "overflow");
    diagnostic_handler!(bound_range, "bound range exceeded");
    diagnostic_handler!(invalid_opcode, "invalid opcode");
    diagnostic_handler!(device_not_available, "device not available");

    pub extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, error_code: u64) -> ! {
        crate::kfatal!(
            "double fault (code={:#x}) at rip={:#x}",
            error_code,
            { frame.instruction_pointer }
        );
        halt_loop();
    }

    diagnostic_handler_err!(invalid_tss, "invalid tss");
    diagnostic_handler_err!(segment_not_present, "segment not present");
    diagnostic_handler_err!(stack_segment_fault, "stack segment fault");
    diagnostic_handler_err!(general_protection, "general protection");

    pub extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, error_code: u64) {
        let fault_addr: u64;
        // SAFETY: CR2 holds the faulting linear address, read-only.
        unsafe { core::arch::asm!("mov {}, cr2", out(reg) fault_addr, options(nomem, nostack, preserves_flags)) };

        let virt = crate::addr::VirtAddr::new_truncate(fault_addr);
        let rescued = crate::mm::vmm::with_active(|vmm| vmm.try_rescue_mmio_fault(virt));
        if rescued {
            return;
        }

        crate::kfatal!(
            "page fault: addr={:#x} code={:#x} (present={} write={} user={}) rip={:#x}",
            fault_addr,
            error_code,
            error_code & super::pf_error::PRESENT != 0,
            error_code & super::pf_error::WRITE != 0,
            error_code & super::pf_error::USER != 0,
            { frame.instruction_pointer }
        );
        halt_loop();
    }

    diagnostic_handler!(x87_floating_point, "x87 floating point");
    diagnostic_handler_err!(alignment_check, "alignment check");

    pub extern "x86-interrupt" fn machine_check(frame: InterruptStackFrame) -> ! {
        crate::kfatal!("machine check at rip={:#x}", { frame.instruction_pointer });
        halt_loop();
    }

    diagnostic_handler!(simd_floating_point, "simd floating point");
}

/// Hardware IRQ dispatch table (vectors 32-47, IRQ lines 0-15).
pub mod dispatch {
    use super::InterruptStackFrame;
    use core::sync::atomic::{AtomicPtr, Ordering};

    const NUM_IRQS: usize = 16;

    /// Signature a registered IRQ handler must have. Takes the IRQ line
    /// number (0-15), not the raw vector.
    pub type IrqHandler = fn(u8);

    static HANDLERS: [AtomicPtr<()>; NUM_IRQS] = [const { AtomicPtr::new(core::ptr::null_mut()) }; NUM_IRQS];

    /// Registers `handler` for `irq` (0-15). Overwrites any previous
    /// registration.
    pub fn register(irq: u8, handler: IrqHandler) {
        HANDLERS[irq as usize].store(handler as *mut (), Ordering::Release);
    }

    fn dispatch_irq(irq: u8) {
        let ptr = HANDLERS[irq as usize].load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: only valid `IrqHandler` pointers are ever stored here.
            let handler: IrqHandler = unsafe { core::mem::transmute(ptr) };
            handler(irq);
        }
        // SAFETY: called from the tail of this IRQ's own stub.
        unsafe { super::super::pic::send_eoi(super::super::pic::MASTER_OFFSET + irq) };
    }

    macro_rules! irq_stub {
        ($irq:expr) => {{
            extern "x86-interrupt" fn stub(_frame: InterruptStackFrame) {
                dispatch_irq($irq);
            }
            stub
        }};
    }

    /// One `extern "x86-interrupt"` stub per IRQ line, installed at IDT
    /// vectors 32..48 in order.
    pub static IRQ_STUBS: [extern "x86-interrupt" fn(InterruptStackFrame); NUM_IRQS] = [
        irq_stub!(0),
        irq_stub!(1),
        irq_stub!(2),
        irq_stub!(3),
        irq_stub!(4),
        irq_stub!(5),
        irq_stub!(6),
        irq_stub!(7),
        irq_stub!(8),
        irq_stub!(9),
        irq_stub!(10),
        irq_stub!(11),
        irq_stub!(12),
        irq_stub!(13),
        irq_stub!(14),
        irq_stub!(15),
    ];
}
