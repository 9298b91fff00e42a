//! Bitmap-based physical frame allocator.
//!
//! Covers the single largest `Usable` region reported by the loader (other
//! `Usable` regions are ignored — a documented v1 limitation). Non-usable
//! regions overlapping the managed range are pre-marked used, and the
//! bitmap's own backing storage is reserved out of the region it describes.

use crate::addr::PhysAddr;
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, Result};
use crate::mm::{MemoryKind, MemoryRegion};
use crate::paging::PhysFrame;
use crate::sync::SpinLock;

/// Bitmap frame allocator. One bit per 4 KiB frame within `[base, base +
/// total_frames * PAGE_SIZE)`; `1` means allocated/reserved, `0` means free.
pub struct BitmapAllocator {
    bitmap: &'static mut [u64],
    base: PhysAddr,
    total_frames: usize,
    free_count: usize,
    search_hint: usize,
}

impl BitmapAllocator {
    /// Builds an allocator over the largest usable region in `regions`.
    ///
    /// The bitmap itself is carved out of that same region and marked used.
    ///
    /// # Safety
    ///
    /// `hhdm_offset` must be the correct, already-initialized HHDM offset,
    /// and every `Usable` region in `regions` must in fact be free RAM (the
    /// loader's memory map must be trustworthy).
    pub unsafe fn new(regions: &[MemoryRegion], hhdm_offset: u64) -> Result<Self> {
        let largest = regions
            .iter()
            .filter(|r| r.kind == MemoryKind::Usable)
            .max_by_key(|r| r.len)
            .ok_or(KernelError::OutOfMemory)?;

        let base = PhysAddr::new(largest.base).align_up(PAGE_SIZE);
        let end = PhysAddr::new(largest.base + largest.len).align_down(PAGE_SIZE);
        if end.as_u64() <= base.as_u64() {
            return Err(KernelError::OutOfMemory);
        }
        let total_frames = ((end.as_u64() - base.as_u64()) / PAGE_SIZE) as usize;
        let bitmap_words = total_frames.div_ceil(64);
        let bitmap_bytes = bitmap_words * 8;
        let bitmap_frames = (bitmap_bytes as u64).div_ceil(PAGE_SIZE) as usize;

        // The bitmap's backing storage lives at the very start of the
        // managed region, in HHDM-mapped memory (no VMM mapping needed yet —
        // this resolves the VMM/PFA bootstrap ordering).
        let bitmap_phys = base;
        let bitmap_virt = (bitmap_phys.as_u64() + hhdm_offset) as *mut u64;
        // SAFETY: `bitmap_virt` points at `bitmap_bytes` of HHDM-mapped,
        // loader-reported usable physical memory that nothing else has
        // claimed yet.
        let bitmap = unsafe { core::slice::from_raw_parts_mut(bitmap_virt, bitmap_words) };
        bitmap.fill(u64::MAX);

        let mut alloc = Self {
            bitmap,
            base,
            total_frames,
            free_count: 0,
            search_hint: 0,
        };

        // Mark the whole managed range free, then re-apply every non-usable
        // overlap, then reserve the bitmap's own storage.
        alloc.mark_range_free(base.as_u64(), end.as_u64());
        for region in regions {
            if region.kind == MemoryKind::Usable {
                continue;
            }
            alloc.reserve_overlap(region.base, region.len);
        }
        alloc.reserve_region(bitmap_phys.as_u64(), bitmap_frames as u64 * PAGE_SIZE)?;

        Ok(alloc)
    }

    fn frame_index(&self, phys: u64) -> Option<usize> {
        if phys < self.base.as_u64() {
            return None;
        }
        let idx = ((phys - self.base.as_u64()) / PAGE_SIZE) as usize;
        (idx < self.total_frames).then_some(idx)
    }

    fn mark_range_free(&mut self, start: u64, end: u64) {
        let start = start.max(self.base.as_u64());
        let end = end.min(self.base.as_u64() + self.total_frames as u64 * PAGE_SIZE);
        if end <= start {
            return;
        }
        let first = ((start - self.base.as_u64()) / PAGE_SIZE) as usize;
        let last = ((end - self.base.as_u64()) / PAGE_SIZE) as usize;
        for i in first..last {
            if self.clear_bit(i) {
                self.free_count += 1;
            }
        }
    }

    fn reserve_overlap(&mut self, phys_start: u64, len: u64) {
        let managed_end = self.base.as_u64() + self.total_frames as u64 * PAGE_SIZE;
        let start = phys_start.max(self.base.as_u64());
        let end = (phys_start + len).min(managed_end);
        if end <= start {
            return;
        }
        let first = ((start - self.base.as_u64()) / PAGE_SIZE) as usize;
        let last = (end - self.base.as_u64()).div_ceil(PAGE_SIZE) as usize;
        for i in first..last.min(self.total_frames) {
            if self.set_bit(i) {
                self.free_count -= 1;
            }
        }
    }

    /// Directly marks `[base, base + size)` used, without going through the
    /// allocation search — used for carving out the bitmap's own storage and
    /// for callers that reserve memory known in advance (e.g. the kernel
    /// image itself).
    pub fn reserve_region(&mut self, base: u64, size: u64) -> Result<()> {
        let start = PhysAddr::new(base).align_down(PAGE_SIZE).as_u64();
        let end = PhysAddr::new(base + size).align_up(PAGE_SIZE).as_u64();
        let first = self.frame_index(start).ok_or(KernelError::OutOfMemory)?;
        let last_exclusive = ((end - self.base.as_u64()) / PAGE_SIZE) as usize;
        for i in first..last_exclusive.min(self.total_frames) {
            if self.set_bit(i) {
                self.free_count -= 1;
            }
        }
        Ok(())
    }

    /// Returns `true` if the bit was previously clear (i.e. this call
    /// actually changed state).
    fn set_bit(&mut self, idx: usize) -> bool {
        let word = idx / 64;
        let bit = idx % 64;
        let was_clear = self.bitmap[word] & (1 << bit) == 0;
        self.bitmap[word] |= 1 << bit;
        was_clear
    }

    /// Returns `true` if the bit was previously set.
    fn clear_bit(&mut self, idx: usize) -> bool {
        let word = idx / 64;
        let bit = idx % 64;
        let was_set = self.bitmap[word] & (1 << bit) != 0;
        self.bitmap[word] &= !(1 << bit);
        was_set
    }

    fn frame_addr(&self, idx: usize) -> PhysAddr {
        PhysAddr::new(self.base.as_u64() + idx as u64 * PAGE_SIZE)
    }

    /// Allocates a single free frame.
    pub fn allocate_frame(&mut self) -> Result<PhysFrame> {
        self.allocate_frames(1)
    }

    /// Allocates `n` contiguous free frames, first-fit.
    ///
    /// Scans word-at-a-time: a word that is entirely `u64::MAX` (fully
    /// occupied) is skipped in one comparison, and within a partially-free
    /// word `trailing_zeros()` on the inverted word locates the next clear
    /// bit directly instead of testing one bit at a time.
    pub fn allocate_frames(&mut self, n: usize) -> Result<PhysFrame> {
        if n == 0 || n > self.total_frames {
            return Err(KernelError::OutOfMemory);
        }

        // Two passes: from the hint to the end, then from the start up to
        // the hint, so repeated small allocations don't re-scan exhausted
        // low memory every time, while still covering the whole bitmap.
        let hint_word = self.search_hint / 64;
        let total_words = self.bitmap.len();
        let start = self
            .find_run(hint_word, total_words, n)
            .or_else(|| self.find_run(0, hint_word + 1, n))
            .ok_or(KernelError::OutOfMemory)?;

        for i in start..start + n {
            self.set_bit(i);
        }
        self.free_count -= n;
        self.search_hint = start + n;
        Ok(PhysFrame::from_start_address(self.frame_addr(start)).expect("frame-aligned by construction"))
    }

    /// Looks for a run of `n` consecutive clear bits within word range
    /// `[word_from, word_to)`. Returns the run's starting bit index.
    fn find_run(&self, word_from: usize, word_to: usize, n: usize) -> Option<usize> {
        let mut run_start: Option<usize> = None;
        let mut run_len = 0usize;

        for word_idx in word_from..word_to.min(self.bitmap.len()) {
            let word = self.bitmap[word_idx];

            // Fully-occupied word: one comparison rules out all 64 bits and
            // breaks any run in progress.
            if word == u64::MAX {
                run_start = None;
                run_len = 0;
                continue;
            }

            let mut bit = 0usize;
            while bit < 64 {
                let global = word_idx * 64 + bit;
                if global >= self.total_frames {
                    return None;
                }
                if word & (1 << bit) == 0 {
                    if run_start.is_none() {
                        run_start = Some(global);
                    }
                    run_len += 1;
                    if run_len == n {
                        return run_start;
                    }
                    bit += 1;
                } else {
                    run_start = None;
                    run_len = 0;
                    // `trailing_zeros` on the word shifted to this bit finds
                    // the next clear bit directly, skipping the whole run of
                    // set bits in one step instead of testing each one.
                    let skip = (word >> bit).trailing_ones() as usize;
                    bit += skip.max(1);
                }
            }
        }
        None
    }

    /// Frees a single frame. Freeing an already-free frame is a no-op, not a
    /// fault — callers are not required to track whether a frame was
    /// already released.
    pub fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.deallocate_frames(frame, 1);
    }

    /// Frees `n` frames starting at `frame`.
    pub fn deallocate_frames(&mut self, frame: PhysFrame, n: usize) {
        let Some(start) = self.frame_index(frame.start_address().as_u64()) else {
            return;
        };
        for i in start..(start + n).min(self.total_frames) {
            if self.clear_bit(i) {
                self.free_count += 1;
            }
        }
        if start < self.search_hint {
            self.search_hint = start;
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_count
    }
}

static PMM: SpinLock<Option<BitmapAllocator>> = SpinLock::new(None);

/// Installs the global allocator. Must be called exactly once, early in
/// boot, after the HHDM offset is known.
///
/// # Safety
///
/// See [`BitmapAllocator::new`].
pub unsafe fn init(regions: &[MemoryRegion], hhdm_offset: u64) -> Result<()> {
    let allocator = unsafe { BitmapAllocator::new(regions, hhdm_offset)? };
    *PMM.lock_irq() = Some(allocator);
    Ok(())
}

/// Runs `f` with exclusive access to the global allocator.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn with<R>(f: impl FnOnce(&mut BitmapAllocator) -> R) -> R {
    let mut guard = PMM.lock_irq();
    f(guard.as_mut().expect("PMM not initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    /// Allocates host memory and pretends it is HHDM-mapped physical memory
    /// starting at physical address 0, i.e. `hhdm_offset = virt - 0`. This
    /// mirrors the trick the original allocator's own tests use to exercise
    /// bitmap logic without real physical memory.
    struct FakeMemory {
        ptr: *mut u8,
        layout: Layout,
        hhdm_offset: u64,
    }

    impl FakeMemory {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, 4096).unwrap();
            // SAFETY: layout has non-zero size, alignment is a power of two.
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self {
                ptr,
                layout,
                hhdm_offset: ptr as u64,
            }
        }

        fn region(&self, len: u64) -> MemoryRegion {
            MemoryRegion {
                base: 0,
                len,
                kind: MemoryKind::Usable,
            }
        }
    }

    impl Drop for FakeMemory {
        fn drop(&mut self) {
            // SAFETY: ptr/layout match the allocation in `new`.
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn frame_round_trip_and_accounting() {
        let mem = FakeMemory::new(16 * 1024 * 1024);
        let region = mem.region(16 * 1024 * 1024);
        // SAFETY: `mem` backs the entire region and the offset is correct.
        let mut pmm = unsafe { BitmapAllocator::new(&[region], mem.hhdm_offset) }.unwrap();

        let total = pmm.total_frames();
        assert_eq!(total, pmm.used_frames() + pmm.free_frames());

        let before_free = pmm.free_frames();
        let run = pmm.allocate_frames(4).unwrap();
        assert_eq!(pmm.free_frames(), before_free - 4);
        assert_eq!(total, pmm.used_frames() + pmm.free_frames());

        pmm.deallocate_frames(run, 4);
        assert_eq!(pmm.free_frames(), before_free);
    }

    #[test]
    fn double_free_is_a_no_op() {
        let mem = FakeMemory::new(4 * 1024 * 1024);
        let region = mem.region(4 * 1024 * 1024);
        // SAFETY: see above.
        let mut pmm = unsafe { BitmapAllocator::new(&[region], mem.hhdm_offset) }.unwrap();

        let frame = pmm.allocate_frame().unwrap();
        let free_after_alloc = pmm.free_frames();
        pmm.deallocate_frame(frame);
        let free_after_first_free = pmm.free_frames();
        assert_eq!(free_after_first_free, free_after_alloc + 1);

        pmm.deallocate_frame(frame);
        assert_eq!(pmm.free_frames(), free_after_first_free);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mem = FakeMemory::new(1024 * 1024);
        let region = mem.region(1024 * 1024);
        // SAFETY: see above.
        let mut pmm = unsafe { BitmapAllocator::new(&[region], mem.hhdm_offset) }.unwrap();

        let free = pmm.free_frames();
        assert!(pmm.allocate_frames(free + 1).is_err());
        assert!(pmm.allocate_frames(free).is_ok());
        assert_eq!(pmm.allocate_frame(), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn reserve_region_sets_bits_directly() {
        let mem = FakeMemory::new(4 * 1024 * 1024);
        let region = mem.region(4 * 1024 * 1024);
        // SAFETY: see above.
        let mut pmm = unsafe { BitmapAllocator::new(&[region], mem.hhdm_offset) }.unwrap();

        let free_before = pmm.free_frames();
        pmm.reserve_region(2 * 1024 * 1024, 8 * 4096).unwrap();
        assert_eq!(pmm.free_frames(), free_before - 8);
    }
}
