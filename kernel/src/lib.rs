//! Ember kernel library.
//!
//! A small x86-64 hobby kernel: a bitmap physical frame allocator, a
//! 4-level virtual memory manager built on a higher-half direct map, an
//! IDT/PIC/PIT interrupt layer, a preemptive multi-level priority
//! scheduler, and a DMA descriptor-ring NIC driver. Booted via a
//! Limine-compatible loader.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

// ── Always-available modules (pure logic, host-testable) ──────────────────

pub mod addr;
pub mod config;
pub mod error;
pub mod log;
pub mod mm;
pub mod paging;
pub mod sched;
pub mod sync;

// ── Kernel-runtime modules (require target_os = "none") ───────────────────

#[cfg(target_os = "none")]
pub mod arch;
#[cfg(target_os = "none")]
pub mod boot;
#[cfg(target_os = "none")]
pub mod drivers;

#[cfg(not(test))]
mod panic;

/// Intel vendor ID; every E1000-class card this driver targets is Intel's.
#[cfg(target_os = "none")]
const VENDOR_INTEL: u16 = 0x8086;

/// Device IDs of the E1000-class parts this driver recognizes: 82540EM
/// (QEMU's default `e1000` model), 82545EM, and 82574L.
#[cfg(target_os = "none")]
const E1000_DEVICE_IDS: [u16; 3] = [0x100E, 0x100F, 0x10D3];

#[cfg(target_os = "none")]
fn tick_irq(_irq: u8) {
    arch::x86_64::pit::on_tick();
    sched::scheduler::on_tick();
}

/// Probes the PCI bus for a recognized NIC and brings it up if one is
/// found. Absence of a NIC is not fatal: the spec's other subsystems don't
/// depend on it.
#[cfg(target_os = "none")]
fn probe_nic() {
    use drivers::pci;

    let mut bar0: Option<(u8, u8, u8, crate::addr::PhysAddr)> = None;
    pci::cam::scan(|dev| {
        if bar0.is_some() {
            return;
        }
        if dev.vendor_id != VENDOR_INTEL || !E1000_DEVICE_IDS.contains(&dev.device_id) {
            return;
        }
        let low = pci::cam::bar(dev.bus, dev.device, dev.function, 0);
        let high = pci::cam::bar(dev.bus, dev.device, dev.function, 1);
        let Some(mem_bar) = pci::decode_bar(low, high) else {
            return;
        };
        crate::kinfo!(
            "pci: found e1000-class nic {:04x}:{:04x} at {:02x}:{:02x}.{} (bar0={:#x})",
            dev.vendor_id,
            dev.device_id,
            dev.bus,
            dev.device,
            dev.function,
            mem_bar.base.as_u64()
        );
        bar0 = Some((dev.bus, dev.device, dev.function, mem_bar.base));
    });

    let Some((_, _, _, bar0_phys)) = bar0 else {
        crate::kinfo!("pci: no recognized nic found");
        return;
    };

    // SAFETY: `bar0_phys` was just decoded from a real BAR0 belonging to a
    // device this driver recognizes; the PFA/VMM/HHDM globals are already
    // initialized by `boot::entry`.
    match unsafe { drivers::e1000::hw::E1000::init(bar0_phys) } {
        Ok(_nic) => crate::kinfo!("e1000: device initialized"),
        Err(e) => crate::kerr!("e1000: failed to initialize: {}", e),
    }
}

/// Runs after [`boot::entry`] has installed the PFA, HHDM, and VMM: brings
/// up the GDT/IDT/PIC/PIT interrupt layer, starts the scheduler, probes the
/// PCI bus for a NIC, then hands off to the scheduler forever.
#[cfg(target_os = "none")]
pub fn kernel_main() -> ! {
    // SAFETY: runs once, early in boot, before the IDT is loaded.
    unsafe { arch::x86_64::gdt::init() };
    // SAFETY: GDT is initialized.
    unsafe { arch::x86_64::idt::init() };
    // SAFETY: runs once, early in boot, with interrupts still disabled.
    unsafe { arch::x86_64::pic::remap() };
    // SAFETY: PIC is remapped and IRQ0 is still masked.
    unsafe { arch::x86_64::pit::init() };

    arch::x86_64::interrupts::dispatch::register(0, tick_irq);
    // SAFETY: the IDT is loaded and IRQ0's handler is registered above.
    unsafe { arch::x86_64::pic::unmask(0) };

    sched::scheduler::init().expect("failed to initialize the scheduler");
    crate::kinfo!("scheduler: idle thread ready");

    probe_nic();

    crate::kinfo!("ember: boot complete, starting scheduler");
    // SAFETY: the scheduler was just initialized by `sched::scheduler::init`.
    unsafe { sched::scheduler::start() }
}
