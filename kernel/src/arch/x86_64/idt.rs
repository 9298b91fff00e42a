//! Interrupt Descriptor Table: 256 entries, exceptions at 0-31, IRQs at
//! 32-47.
//!
//! Handler bodies use the `extern "x86-interrupt"` calling convention
//! instead of hand-written naked-assembly stubs — the compiler emits the
//! equivalent prologue/epilogue (push a dummy error code where the CPU
//! doesn't supply one, save the interrupt frame, 16-byte-align the stack,
//! call the body, `iretq`).

use core::arch::asm;
use core::mem::size_of;

use crate::sync::LazyLock;

use super::gdt::DOUBLE_FAULT_IST_INDEX;
use super::interrupts::{dispatch, handlers};

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn set(&mut self, handler: u64, ist: u8, dpl: u8) {
        self.offset_low = (handler & 0xFFFF) as u16;
        self.offset_mid = ((handler >> 16) & 0xFFFF) as u16;
        self.offset_high = (handler >> 32) as u32;
        self.selector = 0x08; // kernel code selector, see gdt.rs
        self.ist = ist & 0x7;
        // present (0x80) | DPL<<5 | interrupt gate type (0xE)
        self.type_attr = 0x80 | ((dpl & 0x3) << 5) | 0x0E;
    }
}

#[repr(C, align(16))]
struct InterruptDescriptorTable {
    entries: [IdtEntry; 256],
}

impl InterruptDescriptorTable {
    fn new() -> Self {
        Self {
            entries: [IdtEntry::missing(); 256],
        }
    }
}

static IDT: LazyLock<InterruptDescriptorTable> = LazyLock::new(|| {
    let mut idt = InterruptDescriptorTable::new();

    idt.entries[0].set(handlers::divide_error as u64, 0, 0);
    idt.entries[1].set(handlers::debug as u64, 0, 0);
    idt.entries[2].set(handlers::nmi as u64, 0, 0);
    idt.entries[3].set(handlers::breakpoint as u64, 0, 3);
    idt.entries[4].set(handlers::overflow as u64, 0, 0);
    idt.entries[5].set(handlers::bound_range as u64, 0, 0);
    idt.entries[6].set(handlers::invalid_opcode as u64, 0, 0);
    idt.entries[7].set(handlers::device_not_available as u64, 0, 0);
    idt.entries[8].set(handlers::double_fault as u64, DOUBLE_FAULT_IST_INDEX, 0);
    idt.entries[10].set(handlers::invalid_tss as u64, 0, 0);
    idt.entries[11].set(handlers::segment_not_present as u64, 0, 0);
    idt.entries[12].set(handlers::stack_segment_fault as u64, 0, 0);
    idt.entries[13].set(handlers::general_protection as u64, 0, 0);
    idt.entries[14].set(handlers::page_fault as u64, 0, 0);
    idt.entries[16].set(handlers::x87_floating_point as u64, 0, 0);
    idt.entries[17].set(handlers::alignment_check as u64, 0, 0);
    idt.entries[18].set(handlers::machine_check as u64, 0, 0);
    idt.entries[19].set(handlers::simd_floating_point as u64, 0, 0);

    for (i, stub) in dispatch::IRQ_STUBS.iter().enumerate() {
        idt.entries[32 + i].set(*stub as u64, 0, 0);
    }

    idt
});

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u64,
}

/// Loads the IDT into the CPU.
///
/// # Safety
///
/// Must be called after GDT initialization (the kernel code selector must
/// be valid).
pub unsafe fn init() {
    let idt = &*IDT;
    let ptr = DescriptorTablePointer {
        limit: (size_of::<InterruptDescriptorTable>() - 1) as u16,
        base: idt as *const InterruptDescriptorTable as u64,
    };
    // SAFETY: `ptr` describes a valid, static, 256-entry IDT.
    unsafe { asm!("lidt [{}]", in(reg) &ptr, options(nostack, preserves_flags)) };
    crate::kdebug!("idt: loaded");
}
