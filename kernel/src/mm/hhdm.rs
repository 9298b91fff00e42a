//! Higher Half Direct Map (HHDM) global offset and address conversion.
//!
//! The loader maps all physical memory at a fixed virtual offset; this
//! module stores that offset globally so any code can convert between
//! physical and virtual addresses without threading the offset through
//! every call site. Page tables are walked through this mapping rather than
//! through their own installed virtual addresses, which is what lets the
//! VMM build new mappings using frames the PFA just handed it.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::addr::{PhysAddr, VirtAddr};

/// Sentinel indicating the HHDM offset has not been initialized.
const HHDM_UNINIT: u64 = u64::MAX;

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(HHDM_UNINIT);

/// Initializes the global HHDM offset. Must be called exactly once, early
/// in boot, before the PFA or VMM are touched.
///
/// # Panics
///
/// Panics if called more than once.
pub fn init(offset: u64) {
    let prev =
        HHDM_OFFSET.compare_exchange(HHDM_UNINIT, offset, Ordering::Release, Ordering::Relaxed);
    assert!(prev.is_ok(), "hhdm: already initialized");
}

/// Returns the HHDM offset.
///
/// # Panics
///
/// Panics if called before [`init`].
#[inline]
pub fn offset() -> u64 {
    let val = HHDM_OFFSET.load(Ordering::Acquire);
    assert!(val != HHDM_UNINIT, "hhdm: accessed before initialization");
    val
}

/// Converts a physical address to its HHDM virtual address.
#[inline]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new_truncate(phys.as_u64() + offset())
}

/// Converts an HHDM virtual address back to a physical address.
#[inline]
pub fn virt_to_phys(virt: VirtAddr) -> PhysAddr {
    PhysAddr::new(virt.as_u64() - offset())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering as O;

    #[test]
    fn round_trips_through_offset() {
        // Directly poke the atomic for this isolated test rather than going
        // through `init`, since `init` enforces single-initialization and
        // other tests in this binary may already have called it.
        HHDM_OFFSET.store(0x1000_0000, O::Release);
        let p = PhysAddr::new(0x2000);
        let v = phys_to_virt(p);
        assert_eq!(v.as_u64(), 0x1000_2000);
        assert_eq!(virt_to_phys(v), p);
    }
}
