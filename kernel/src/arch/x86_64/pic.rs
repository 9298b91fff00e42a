//! 8259 Programmable Interrupt Controller: remap and IRQ mask control.
//!
//! Unlike a kernel that hands interrupt routing off to an APIC, this kernel
//! keeps the legacy PIC live as its only interrupt router, so after the
//! remap below IRQs are unmasked individually as each device driver wants
//! them, rather than all being masked immediately.

use super::port::{io_wait, Port};

const PIC1_CMD: Port<u8> = Port::new(0x20);
const PIC1_DATA: Port<u8> = Port::new(0x21);
const PIC2_CMD: Port<u8> = Port::new(0xA0);
const PIC2_DATA: Port<u8> = Port::new(0xA1);

const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;

/// Vector base for the master PIC (IRQ0..7 -> 32..39).
pub const MASTER_OFFSET: u8 = 32;
/// Vector base for the slave PIC (IRQ8..15 -> 40..47).
pub const SLAVE_OFFSET: u8 = 40;

const EOI: u8 = 0x20;

/// Remaps the PIC so its IRQs land on vectors 32-47 instead of the BIOS
/// default 8-15/0x70-77 (which collide with CPU exception vectors), and
/// masks every line. Callers unmask the lines they actually handle.
///
/// # Safety
///
/// Must run once, early in boot, with interrupts disabled.
pub unsafe fn remap() {
    // SAFETY: standard PIC remap sequence; each write is to a PIC command
    // or data port during the documented initialization sequence.
    unsafe {
        PIC1_CMD.write(ICW1_INIT);
        io_wait();
        PIC2_CMD.write(ICW1_INIT);
        io_wait();
        PIC1_DATA.write(MASTER_OFFSET);
        io_wait();
        PIC2_DATA.write(SLAVE_OFFSET);
        io_wait();
        PIC1_DATA.write(4); // tell master: slave on IRQ2
        io_wait();
        PIC2_DATA.write(2); // tell slave: its cascade identity
        io_wait();
        PIC1_DATA.write(ICW4_8086);
        io_wait();
        PIC2_DATA.write(ICW4_8086);
        io_wait();

        // Mask everything; individual drivers unmask what they need.
        PIC1_DATA.write(0xFF);
        PIC2_DATA.write(0xFF);
    }
    crate::kdebug!("pic: remapped to vectors {}..{}", MASTER_OFFSET, SLAVE_OFFSET + 8);
}

/// Unmasks IRQ line `irq` (0..15), clearing the cascade line on the master
/// first if the line lives on the slave.
///
/// # Safety
///
/// Must be called after [`remap`].
pub unsafe fn unmask(irq: u8) {
    // SAFETY: standard mask-register read-modify-write.
    unsafe {
        if irq < 8 {
            let mask = PIC1_DATA.read() & !(1 << irq);
            PIC1_DATA.write(mask);
        } else {
            let mask = PIC2_DATA.read() & !(1 << (irq - 8));
            PIC2_DATA.write(mask);
            let master_mask = PIC1_DATA.read() & !(1 << 2);
            PIC1_DATA.write(master_mask);
        }
    }
}

/// Sends end-of-interrupt for `vector`. Sends to both PICs if `vector` came
/// from the slave (>= 40).
///
/// # Safety
///
/// Must only be called from the tail of an interrupt handler for `vector`.
pub unsafe fn send_eoi(vector: u8) {
    // SAFETY: EOI writes have no effect beyond acknowledging the interrupt.
    unsafe {
        if vector >= SLAVE_OFFSET {
            PIC2_CMD.write(EOI);
        }
        PIC1_CMD.write(EOI);
    }
}
