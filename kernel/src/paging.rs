//! 4 KiB page / physical frame newtypes and page-table entry bits.
//!
//! This kernel only ever manages one page size, so unlike a generic paging
//! crate there is no `PageSize` trait here — `Page` and `PhysFrame` are
//! concrete 4 KiB types.

use core::fmt;

use crate::addr::{PhysAddr, VirtAddr};
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, Result};

/// A 4 KiB-aligned virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Page {
    start: VirtAddr,
}

impl Page {
    /// Returns the page containing `addr`.
    pub const fn containing_address(addr: VirtAddr) -> Self {
        Self {
            start: addr.align_down(PAGE_SIZE),
        }
    }

    /// Returns the page starting exactly at `addr`.
    pub fn from_start_address(addr: VirtAddr) -> Result<Self> {
        if !addr.is_aligned(PAGE_SIZE) {
            return Err(KernelError::Misaligned);
        }
        Ok(Self { start: addr })
    }

    pub const fn start_address(self) -> VirtAddr {
        self.start
    }

    pub const fn size(self) -> u64 {
        PAGE_SIZE
    }
}

/// A 4 KiB-aligned physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysFrame {
    start: PhysAddr,
}

impl PhysFrame {
    pub const fn containing_address(addr: PhysAddr) -> Self {
        Self {
            start: addr.align_down(PAGE_SIZE),
        }
    }

    pub fn from_start_address(addr: PhysAddr) -> Result<Self> {
        if !addr.is_aligned(PAGE_SIZE) {
            return Err(KernelError::Misaligned);
        }
        Ok(Self { start: addr })
    }

    pub const fn start_address(self) -> PhysAddr {
        self.start
    }

    pub const fn size(self) -> u64 {
        PAGE_SIZE
    }
}

impl fmt::LowerHex for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.start.as_u64())
    }
}

bitflags::bitflags! {
    /// Bits of a page-table entry (covers both intermediate and leaf forms).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Mask over the physical-address field of a page-table entry (bits 12..51).
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// A single 64-bit page-table entry.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ENTRY_ADDR_MASK)
    }

    pub const fn set(&mut self, frame: PhysFrame, flags: EntryFlags) {
        self.0 = (frame.start_address().as_u64() & ENTRY_ADDR_MASK) | flags.bits();
    }

    pub const fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A 512-entry, 4 KiB-aligned page table (any of PML4/PDPT/PD/PT).
#[repr(align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; 512],
}

impl PageTable {
    pub const fn empty() -> Self {
        Self {
            entries: [PageTableEntry::empty(); 512],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_containing_address_aligns_down() {
        let p = Page::containing_address(VirtAddr::new_truncate(0x1234));
        assert_eq!(p.start_address().as_u64(), 0x1000);
    }

    #[test]
    fn from_start_address_rejects_misaligned() {
        assert_eq!(
            Page::from_start_address(VirtAddr::new_truncate(0x1001)),
            Err(KernelError::Misaligned)
        );
    }

    #[test]
    fn entry_round_trips_frame_and_flags() {
        let frame = PhysFrame::from_start_address(PhysAddr::new(0x20_0000)).unwrap();
        let mut entry = PageTableEntry::empty();
        entry.set(
            frame,
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::CACHE_DISABLE,
        );
        assert!(entry.is_present());
        assert_eq!(entry.addr(), frame.start_address());
        assert!(entry.flags().contains(EntryFlags::CACHE_DISABLE));
        assert!(!entry.flags().contains(EntryFlags::USER));
    }
}
