//! x86-64 architecture layer: ports, GDT/TSS, IDT, PIC, PIT, context switch.
//!
//! These modules touch real hardware and are only compiled for the kernel
//! runtime target (`target_os = "none"`); there is nothing here for
//! `cargo test` to exercise on the host.

#![cfg(target_os = "none")]

pub mod context;
pub mod gdt;
pub mod idt;
pub mod interrupts;
pub mod pic;
pub mod pit;
pub mod port;
