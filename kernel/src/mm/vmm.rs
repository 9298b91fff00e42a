//! Virtual memory manager: 4-level page-table walk, map/unmap, and the MMIO
//! bump allocator.
//!
//! Page tables are walked through their HHDM virtual view ([`super::hhdm`]),
//! never through their own installed mapping — this breaks the
//! chicken-and-egg problem where the only way to reach a new page table
//! would be the mapping we are in the middle of installing.

use crate::addr::VirtAddr;
use crate::config::{MMIO_BASE, PAGE_SIZE};
use crate::error::{KernelError, Result};
use crate::mm::hhdm;
use crate::mm::pmm;
use crate::paging::{EntryFlags, PageTable, PhysFrame};
use crate::sync::SpinLock;

/// Flags a caller may request for a mapping; translated to the matching
/// [`EntryFlags`] bits by [`map_page`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MapFlags {
    pub writable: bool,
    pub user: bool,
    pub no_cache: bool,
}

impl MapFlags {
    fn to_entry_flags(self) -> EntryFlags {
        let mut flags = EntryFlags::PRESENT;
        if self.writable {
            flags |= EntryFlags::WRITABLE;
        }
        if self.user {
            flags |= EntryFlags::USER;
        }
        if self.no_cache {
            flags |= EntryFlags::CACHE_DISABLE | EntryFlags::WRITE_THROUGH;
        }
        flags
    }
}

/// Flags appropriate for a device register window: present, writable,
/// caching disabled.
pub const MMIO_FLAGS: MapFlags = MapFlags {
    writable: true,
    user: false,
    no_cache: true,
};

fn table_ptr(frame: PhysFrame) -> *mut PageTable {
    hhdm::phys_to_virt(frame.start_address()).as_mut_ptr()
}

/// Root of the single address space this kernel manages (no per-process
/// address spaces — a non-goal).
pub struct Vmm {
    pml4: PhysFrame,
}

impl Vmm {
    /// Wraps an already-installed PML4 frame (as left by the loader, whose
    /// identity/higher-half mappings we keep using and extend).
    ///
    /// # Safety
    ///
    /// `pml4` must be the frame currently loaded in `CR3`, or a frame
    /// structured identically to it, and the HHDM offset must already be
    /// initialized.
    pub unsafe fn from_existing(pml4: PhysFrame) -> Self {
        Self { pml4 }
    }

    /// Walks the page tables for `virt`, creating any missing intermediate
    /// table with a freshly zeroed frame from the PFA, and maps `virt ->
    /// phys` with `flags`.
    pub fn map_page(&mut self, virt: VirtAddr, phys: PhysFrame, flags: MapFlags) -> Result<()> {
        if !virt.is_aligned(PAGE_SIZE) {
            return Err(KernelError::Misaligned);
        }
        let pt = self.walk_create(virt)?;
        // SAFETY: `pt` is the HHDM view of a live, exclusively-owned page
        // table frame.
        let table = unsafe { &mut *pt };
        table.entries[virt.pt_index()].set(phys, flags.to_entry_flags());
        invlpg(virt);
        Ok(())
    }

    /// Clears the leaf entry for `virt`, if present.
    pub fn unmap_page(&mut self, virt: VirtAddr) -> Result<()> {
        if !virt.is_aligned(PAGE_SIZE) {
            return Err(KernelError::Misaligned);
        }
        let pt = self.walk(virt).ok_or(KernelError::NotMapped)?;
        // SAFETY: see `map_page`.
        let table = unsafe { &mut *pt };
        let entry = &mut table.entries[virt.pt_index()];
        if !entry.is_present() {
            return Err(KernelError::NotMapped);
        }
        entry.clear();
        invlpg(virt);
        Ok(())
    }

    /// Returns the physical address `virt` currently maps to, or `None` if
    /// any level of the walk is not present.
    pub fn get_physical(&self, virt: VirtAddr) -> Option<crate::addr::PhysAddr> {
        let pt = self.walk(virt)?;
        // SAFETY: see `map_page`.
        let table = unsafe { &*pt };
        let entry = table.entries[virt.pt_index()];
        entry
            .is_present()
            .then(|| crate::addr::PhysAddr::new(entry.addr().as_u64() + virt.page_offset()))
    }

    /// Read-only walk down to the PT level; returns `None` on the first
    /// non-present intermediate entry.
    fn walk(&self, virt: VirtAddr) -> Option<*mut PageTable> {
        let pml4 = table_ptr(self.pml4);
        // SAFETY: HHDM view of the live PML4.
        let pml4_entry = unsafe { (*pml4).entries[virt.pml4_index()] };
        if !pml4_entry.is_present() {
            return None;
        }
        let pdpt = table_ptr(PhysFrame::from_start_address(pml4_entry.addr()).ok()?);
        // SAFETY: HHDM view of a table referenced by a present PML4 entry.
        let pdpt_entry = unsafe { (*pdpt).entries[virt.pdpt_index()] };
        if !pdpt_entry.is_present() {
            return None;
        }
        let pd = table_ptr(PhysFrame::from_start_address(pdpt_entry.addr()).ok()?);
        // SAFETY: HHDM view of a table referenced by a present PDPT entry.
        let pd_entry = unsafe { (*pd).entries[virt.pd_index()] };
        if !pd_entry.is_present() {
            return None;
        }
        Some(table_ptr(PhysFrame::from_start_address(pd_entry.addr()).ok()?))
    }

    /// Like [`Self::walk`] but allocates and links a zeroed frame for any
    /// missing intermediate table instead of failing.
    fn walk_create(&mut self, virt: VirtAddr) -> Result<*mut PageTable> {
        let pml4 = table_ptr(self.pml4);
        let pdpt_frame = self.next_level(pml4, virt.pml4_index())?;
        let pdpt = table_ptr(pdpt_frame);
        let pd_frame = self.next_level(pdpt, virt.pdpt_index())?;
        let pd = table_ptr(pd_frame);
        let pt_frame = self.next_level(pd, virt.pd_index())?;
        Ok(table_ptr(pt_frame))
    }

    /// Returns the frame referenced by `table.entries[index]`, allocating
    /// and linking a fresh zeroed table if that entry is not present.
    fn next_level(&mut self, table: *mut PageTable, index: usize) -> Result<PhysFrame> {
        // SAFETY: `table` is an HHDM view of a live, exclusively-owned table.
        let entry = unsafe { (*table).entries[index] };
        if entry.is_present() {
            return PhysFrame::from_start_address(entry.addr()).map_err(|_| KernelError::NotMapped);
        }
        let frame = pmm::with(|alloc| alloc.allocate_frame())?;
        // SAFETY: `frame` was just allocated, exclusively owned, and sized
        // for a `PageTable`.
        unsafe { table_ptr(frame).write(PageTable::empty()) };
        // SAFETY: see above.
        unsafe {
            (*table).entries[index].set(frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        }
        Ok(frame)
    }

    /// Carves `size` (rounded up to a page) out of the MMIO bump region and
    /// maps it to `phys` with caching disabled. Returns the virtual base.
    pub fn map_mmio(&mut self, phys: crate::addr::PhysAddr, size: u64) -> Result<VirtAddr> {
        let pages = size.div_ceil(PAGE_SIZE).max(1);
        let virt_base = alloc_mmio_range(pages * PAGE_SIZE)?;
        for i in 0..pages {
            let frame = PhysFrame::from_start_address(crate::addr::PhysAddr::new(
                phys.as_u64() + i * PAGE_SIZE,
            ))
            .map_err(|_| KernelError::Misaligned)?;
            self.map_page(virt_base + i * PAGE_SIZE, frame, MMIO_FLAGS)?;
        }
        Ok(virt_base)
    }

    /// Page-fault rescue: if `addr` falls in the conventional MMIO physical
    /// window, installs an on-demand cached-disabled mapping identity-mapped
    /// through HHDM and returns `true` so the faulting instruction can be
    /// resumed. Returns `false` for anything else — the caller should treat
    /// the fault as fatal.
    pub fn try_rescue_mmio_fault(&mut self, addr: VirtAddr) -> bool {
        let phys = hhdm::virt_to_phys(addr);
        if !crate::config::MMIO_FAULT_RANGE.contains(&phys.as_u64()) {
            return false;
        }
        let Ok(frame) = PhysFrame::from_start_address(phys.align_down(PAGE_SIZE)) else {
            return false;
        };
        self.map_page(addr.align_down(PAGE_SIZE), frame, MMIO_FLAGS).is_ok()
    }
}

static ACTIVE: SpinLock<Option<Vmm>> = SpinLock::new(None);

/// Installs `vmm` as the kernel's single active address space.
///
/// # Safety
///
/// Must be called exactly once, early in boot, after the corresponding
/// page tables are actually loaded in `CR3`.
pub unsafe fn set_active(vmm: Vmm) {
    *ACTIVE.lock_irq() = Some(vmm);
}

/// Runs `f` with exclusive access to the active VMM.
///
/// # Panics
///
/// Panics if [`set_active`] has not been called yet.
pub fn with_active<R>(f: impl FnOnce(&mut Vmm) -> R) -> R {
    let mut guard = ACTIVE.lock_irq();
    f(guard.as_mut().expect("VMM not initialized"))
}

static MMIO_NEXT: SpinLock<u64> = SpinLock::new(MMIO_BASE);

/// Bump-allocates `size` bytes of MMIO virtual address space. Strictly
/// monotonic: two calls never return overlapping ranges.
fn alloc_mmio_range(size: u64) -> Result<VirtAddr> {
    let mut next = MMIO_NEXT.lock_irq();
    let base = *next;
    let new_next = base.checked_add(size).ok_or(KernelError::RegionExhausted)?;
    *next = new_next;
    Ok(VirtAddr::new_truncate(base))
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn invlpg(virt: VirtAddr) {
    use core::arch::asm;
    // SAFETY: `invlpg` only invalidates the TLB entry for this address.
    unsafe { asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack, preserves_flags)) };
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn invlpg(_virt: VirtAddr) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{MemoryKind, MemoryRegion};
    use std::alloc::{alloc_zeroed, Layout};
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Sets up a fake HHDM-backed PFA + an empty root PML4, once per test
    /// process (the PFA and HHDM offset are process-wide globals).
    fn setup() -> Vmm {
        static mut ROOT: *mut u8 = core::ptr::null_mut();
        INIT.call_once(|| {
            let layout = Layout::from_size_align(32 * 1024 * 1024, 4096).unwrap();
            // SAFETY: layout is non-zero size, power-of-two align.
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            // SAFETY: single-threaded test setup, written once.
            unsafe { ROOT = ptr };
            hhdm::init(ptr as u64);
            let region = MemoryRegion {
                base: 0,
                len: 32 * 1024 * 1024,
                kind: MemoryKind::Usable,
            };
            // SAFETY: `region` is entirely backed by `ptr`'s allocation and
            // the HHDM offset matches.
            unsafe { pmm::init(&[region], ptr as u64) }.unwrap();
        });
        let pml4_frame = pmm::with(|a| a.allocate_frame()).unwrap();
        // SAFETY: freshly allocated frame, HHDM-mapped.
        unsafe { table_ptr(pml4_frame).write(PageTable::empty()) };
        // SAFETY: pml4_frame was just initialized above.
        unsafe { Vmm::from_existing(pml4_frame) }
    }

    #[test]
    fn map_unmap_round_trip() {
        let mut vmm = setup();
        let frame = pmm::with(|a| a.allocate_frame()).unwrap();
        let virt = VirtAddr::new_truncate(0x4000_0000);

        vmm.map_page(virt, frame, MapFlags { writable: true, ..Default::default() })
            .unwrap();
        assert_eq!(vmm.get_physical(virt), Some(frame.start_address()));

        vmm.unmap_page(virt).unwrap();
        assert_eq!(vmm.get_physical(virt), None);
    }

    #[test]
    fn remap_last_write_wins() {
        let mut vmm = setup();
        let f1 = pmm::with(|a| a.allocate_frame()).unwrap();
        let f2 = pmm::with(|a| a.allocate_frame()).unwrap();
        let virt = VirtAddr::new_truncate(0x5000_0000);

        let flags = MapFlags { writable: true, ..Default::default() };
        vmm.map_page(virt, f1, flags).unwrap();
        vmm.map_page(virt, f2, flags).unwrap();
        assert_eq!(vmm.get_physical(virt), Some(f2.start_address()));
    }

    #[test]
    fn mmio_mappings_are_monotonic_and_uncached() {
        let mut vmm = setup();
        let v1 = vmm.map_mmio(crate::addr::PhysAddr::new(0xFEB0_0000), 0x1000).unwrap();
        let v2 = vmm.map_mmio(crate::addr::PhysAddr::new(0xFEC0_0000), 0x1000).unwrap();
        assert!(v2.as_u64() >= v1.as_u64() + 0x1000);

        let pt = vmm.walk(v1).unwrap();
        // SAFETY: `walk` returned a live table pointer.
        let entry = unsafe { (*pt).entries[v1.pt_index()] };
        assert!(entry.flags().contains(EntryFlags::CACHE_DISABLE));
        assert!(entry.flags().contains(EntryFlags::WRITE_THROUGH));
    }
}
