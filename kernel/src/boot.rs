//! Limine boot-protocol glue.
//!
//! Declares the loader requests this kernel needs (base revision, memory
//! map, HHDM offset) in the `.requests` link section Limine scans for, then
//! [`entry`] translates the loader's answers into the kernel's own types and
//! brings up the PFA/HHDM/VMM before handing off to [`crate::kernel_main`].

#![cfg(target_os = "none")]

use limine::memory_map::EntryType;
use limine::request::{HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker};
use limine::BaseRevision;

use crate::addr::PhysAddr;
use crate::mm::{MemoryKind, MemoryRegion};
use crate::paging::PhysFrame;

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// Upper bound on staged memory-map entries. Real Limine maps under QEMU and
/// on bare metal both stay well under this; entries beyond it are dropped
/// (there is no heap yet to grow a buffer into).
const MAX_MEMORY_REGIONS: usize = 128;

fn translate_kind(kind: EntryType) -> MemoryKind {
    match kind {
        EntryType::USABLE => MemoryKind::Usable,
        EntryType::ACPI_RECLAIMABLE => MemoryKind::AcpiReclaimable,
        EntryType::ACPI_NVS => MemoryKind::AcpiNvs,
        EntryType::BAD_MEMORY => MemoryKind::BadMemory,
        EntryType::BOOTLOADER_RECLAIMABLE => MemoryKind::BootloaderReclaimable,
        EntryType::KERNEL_AND_MODULES => MemoryKind::KernelAndModules,
        EntryType::FRAMEBUFFER => MemoryKind::Framebuffer,
        _ => MemoryKind::Reserved,
    }
}

/// Reads the physical frame currently loaded in `CR3`.
fn current_pml4() -> PhysFrame {
    let value: u64;
    // SAFETY: reading CR3 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags))
    };
    PhysFrame::from_start_address(PhysAddr::new(value & !0xFFF))
        .expect("CR3 holds a 4 KiB-aligned frame")
}

/// Entry point reached directly from the loader-provided stack.
///
/// Checks the base revision, initializes the HHDM offset and the PFA from
/// the loader's memory map, wraps the loader's own page tables in a [`Vmm`]
/// and installs it as active, then falls through into [`crate::kernel_main`].
///
/// [`Vmm`]: crate::mm::vmm::Vmm
pub fn entry() -> ! {
    assert!(
        BASE_REVISION.is_supported(),
        "loader does not support the requested Limine base revision"
    );

    let hhdm_offset = HHDM_REQUEST
        .get_response()
        .expect("loader did not answer the HHDM request")
        .offset();
    crate::mm::hhdm::init(hhdm_offset);

    let memory_map = MEMORY_MAP_REQUEST
        .get_response()
        .expect("loader did not answer the memory map request");

    let mut regions = [MemoryRegion { base: 0, len: 0, kind: MemoryKind::Reserved }; MAX_MEMORY_REGIONS];
    let mut count = 0;
    for raw in memory_map.entries() {
        if count >= MAX_MEMORY_REGIONS {
            crate::kwarn!("memory map has more than {} entries, dropping the rest", MAX_MEMORY_REGIONS);
            break;
        }
        regions[count] = MemoryRegion {
            base: raw.base,
            len: raw.length,
            kind: translate_kind(raw.entry_type),
        };
        count += 1;
    }
    let regions = &regions[..count];

    // SAFETY: the HHDM offset was just initialized above and the loader's
    // memory map is trustworthy by the boot-protocol contract.
    unsafe { crate::mm::pmm::init(regions, hhdm_offset) }.expect("failed to initialize the frame allocator");

    // SAFETY: `current_pml4` reads the frame the loader itself left in CR3,
    // and the HHDM offset is initialized, so the VMM can walk it.
    let vmm = unsafe { crate::mm::vmm::Vmm::from_existing(current_pml4()) };
    // SAFETY: `vmm` wraps the page tables CR3 already points at; this is the
    // first and only call, made before anything else touches the VMM.
    unsafe { crate::mm::vmm::set_active(vmm) };

    crate::kernel_main();
}
