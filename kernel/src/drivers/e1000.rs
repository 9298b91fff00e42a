//! E1000-class NIC: DMA descriptor rings and synchronous poll-based I/O.
//!
//! [`TxRing`]/[`RxRing`] are pure descriptor-and-buffer bookkeeping, host
//! testable without any real device. [`hw`] wraps them with the register
//! window and descriptor-base programming a real card needs; only that part
//! is gated to the kernel's own target.

use crate::config::{NIC_BUF_SIZE, NIC_MTU};
use crate::error::NicError;

/// Register byte offsets within the memory-mapped BAR0 window.
pub const REG_CTRL: usize = 0x0000;
pub const REG_STATUS: usize = 0x0008;
pub const REG_ICR: usize = 0x00C0;
pub const REG_IMS: usize = 0x00D0;
pub const REG_IMC: usize = 0x00D8;
pub const REG_RCTL: usize = 0x0100;
pub const REG_TCTL: usize = 0x0400;
pub const REG_RDBAL: usize = 0x2800;
pub const REG_RDBAH: usize = 0x2804;
pub const REG_RDLEN: usize = 0x2808;
pub const REG_RDH: usize = 0x2810;
pub const REG_RDT: usize = 0x2818;
pub const REG_TDBAL: usize = 0x3800;
pub const REG_TDBAH: usize = 0x3804;
pub const REG_TDLEN: usize = 0x3808;
pub const REG_TDH: usize = 0x3810;
pub const REG_TDT: usize = 0x3818;

const CTRL_RST: u32 = 1 << 26;
const RCTL_EN: u32 = 1 << 1;
const RCTL_UPE: u32 = 1 << 3;
const RCTL_MPE: u32 = 1 << 4;
const RCTL_BAM: u32 = 1 << 15;
const RCTL_SECRC: u32 = 1 << 26;
const TCTL_EN: u32 = 1 << 1;
const TCTL_PSP: u32 = 1 << 3;
const TCTL_CT: u32 = 0x10 << 4;
const TCTL_COLD: u32 = 0x40 << 12;

const DD: u8 = 1 << 0;
const CMD_EOP: u8 = 1 << 0;
const CMD_IFCS: u8 = 1 << 1;
const CMD_RS: u8 = 1 << 3;

/// 16-byte legacy RX descriptor.
#[repr(C)]
#[derive(Clone, Copy)]
struct RxDescriptor {
    addr: u64,
    len: u16,
    checksum: u16,
    status: u8,
    errors: u8,
    special: u16,
}

/// 16-byte legacy TX descriptor.
#[repr(C)]
#[derive(Clone, Copy)]
struct TxDescriptor {
    addr: u64,
    len: u16,
    cso: u8,
    cmd: u8,
    status: u8,
    css: u8,
    special: u16,
}

/// Transmit descriptor ring. A slot is available for a new frame exactly
/// when its descriptor's `status` carries `DD` — the at-most-one-in-flight-
/// per-slot invariant the rest of the driver relies on.
pub struct TxRing {
    descriptors: &'static mut [TxDescriptor],
    buffers: &'static mut [[u8; NIC_BUF_SIZE]],
    cursor: usize,
}

impl TxRing {
    /// Wraps already-allocated, equal-length descriptor and buffer slices
    /// into a ring and marks every slot free.
    ///
    /// # Safety
    ///
    /// `descriptors` and `buffers` must be DMA-visible to the device (i.e.
    /// physically contiguous and HHDM- or otherwise identity-addressable),
    /// exclusively owned by this ring, and each `descriptors[i].addr` must
    /// already hold the physical address of `buffers[i]`.
    pub unsafe fn new(
        descriptors: &'static mut [TxDescriptor],
        buffers: &'static mut [[u8; NIC_BUF_SIZE]],
    ) -> Self {
        assert_eq!(descriptors.len(), buffers.len());
        for d in descriptors.iter_mut() {
            d.status = DD;
        }
        Self { descriptors, buffers, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Copies `frame` into the current slot's buffer and flags it for
    /// transmission. Returns `(bytes_queued, new_tail)`; the caller is
    /// responsible for writing `new_tail` into [`REG_TDT`] so the device
    /// notices.
    pub fn send(&mut self, frame: &[u8]) -> Result<(usize, usize), NicError> {
        if frame.is_empty() || frame.len() > NIC_MTU {
            return Err(NicError::BadLength);
        }
        let cur = self.cursor;
        if self.descriptors[cur].status & DD == 0 {
            return Err(NicError::RingFull);
        }
        self.buffers[cur][..frame.len()].copy_from_slice(frame);
        let d = &mut self.descriptors[cur];
        d.len = frame.len() as u16;
        d.cmd = CMD_EOP | CMD_IFCS | CMD_RS;
        d.status = 0;
        self.cursor = (cur + 1) % self.descriptors.len();
        Ok((frame.len(), self.cursor))
    }

    /// Marks slot `slot` complete (`DD` set), as the device would once it
    /// has actually transmitted the frame. Exposed for tests and for a
    /// future TX-complete interrupt handler.
    pub fn mark_done(&mut self, slot: usize) {
        self.descriptors[slot].status = DD;
    }
}

/// Receive descriptor ring.
pub struct RxRing {
    descriptors: &'static mut [RxDescriptor],
    buffers: &'static mut [[u8; NIC_BUF_SIZE]],
    cursor: usize,
}

impl RxRing {
    /// # Safety
    /// See [`TxRing::new`]; descriptors must start with `status` clear (no
    /// frame pending) rather than `DD`.
    pub unsafe fn new(
        descriptors: &'static mut [RxDescriptor],
        buffers: &'static mut [[u8; NIC_BUF_SIZE]],
    ) -> Self {
        assert_eq!(descriptors.len(), buffers.len());
        Self { descriptors, buffers, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// If the device has produced a frame at the current slot (`DD` set),
    /// copies up to `buf.len()` bytes into `buf`, clears the slot, and
    /// returns `(bytes_copied, Some(old_cursor))` — the caller writes
    /// `old_cursor` into [`REG_RDT`] to give the slot back to the device.
    /// Returns `(0, None)` if nothing is pending.
    pub fn recv(&mut self, buf: &mut [u8]) -> (usize, Option<usize>) {
        let cur = self.cursor;
        if self.descriptors[cur].status & DD == 0 {
            return (0, None);
        }
        let n = (self.descriptors[cur].len as usize).min(buf.len());
        buf[..n].copy_from_slice(&self.buffers[cur][..n]);
        self.descriptors[cur].status = 0;
        self.cursor = (cur + 1) % self.descriptors.len();
        (n, Some(cur))
    }

    /// Simulates the device producing a frame into slot `slot`. Exposed for
    /// tests; on real hardware the device itself sets `DD` via DMA.
    pub fn simulate_arrival(&mut self, slot: usize, len: u16) {
        self.descriptors[slot].status = DD;
        self.descriptors[slot].len = len;
    }
}

/// Hardware-facing half: the register window and the rings it drives.
/// Everything touching real MMIO lives behind the kernel's own target so
/// host tests never issue a volatile access to an arbitrary pointer.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod hw {
    use super::*;
    use crate::addr::{PhysAddr, VirtAddr};
    use crate::arch::x86_64::pit;
    use crate::config::NIC_RING_SIZE;
    use crate::mm::hhdm;
    use crate::mm::pmm;
    use crate::mm::vmm;

    /// A live E1000-class device: its register window plus the two rings
    /// it owns.
    pub struct E1000 {
        regs: VirtAddr,
        tx: TxRing,
        rx: RxRing,
    }

    impl E1000 {
        unsafe fn reg_read(&self, offset: usize) -> u32 {
            // SAFETY: `offset` is one of this module's `REG_*` constants,
            // within the BAR0 window `self.regs` was mapped over.
            unsafe { (self.regs.as_ptr::<u8>().add(offset) as *const u32).read_volatile() }
        }

        unsafe fn reg_write(&self, offset: usize, value: u32) {
            // SAFETY: see `reg_read`.
            unsafe { (self.regs.as_mut_ptr::<u8>().add(offset) as *mut u32).write_volatile(value) };
        }

        /// Maps `bar0_phys`, resets the device, allocates and programs the
        /// descriptor rings, and enables RX/TX. Interrupts are left masked;
        /// the driver is polled.
        ///
        /// # Safety
        /// `bar0_phys` must be the physical base of a real E1000-class
        /// register window, and the PFA/VMM/HHDM globals must already be
        /// initialized.
        pub unsafe fn init(bar0_phys: PhysAddr) -> crate::error::Result<Self> {
            let regs = vmm::with_active(|v| v.map_mmio(bar0_phys, 128 * 1024))?;
            let dev = Self {
                regs,
                tx: unsafe { alloc_tx_ring()? },
                rx: unsafe { alloc_rx_ring()? },
            };

            // SAFETY: `regs` is a freshly mapped, exclusively owned register
            // window.
            unsafe {
                dev.reg_write(REG_CTRL, CTRL_RST);
            }
            pit::sleep_ms_busy(10);

            // SAFETY: see above.
            unsafe {
                dev.reg_write(REG_IMC, 0xFFFF_FFFF);
                let _ = dev.reg_read(REG_ICR);
            }

            dev.program_rx_ring()?;
            dev.program_tx_ring()?;

            // SAFETY: see above.
            unsafe {
                dev.reg_write(
                    REG_RCTL,
                    RCTL_EN | RCTL_UPE | RCTL_MPE | RCTL_BAM | RCTL_SECRC,
                );
                dev.reg_write(REG_TCTL, TCTL_EN | TCTL_PSP | TCTL_CT | TCTL_COLD);
            }

            Ok(dev)
        }

        fn program_rx_ring(&self) -> crate::error::Result<()> {
            let phys = hhdm::virt_to_phys(VirtAddr::new(self.rx_descriptors_ptr() as u64));
            // SAFETY: register window is live, values are register-width.
            unsafe {
                self.reg_write(REG_RDBAL, phys.as_u64() as u32);
                self.reg_write(REG_RDBAH, (phys.as_u64() >> 32) as u32);
                self.reg_write(REG_RDLEN, (NIC_RING_SIZE * core::mem::size_of::<RxDescriptor>()) as u32);
                self.reg_write(REG_RDH, 0);
                self.reg_write(REG_RDT, (NIC_RING_SIZE - 1) as u32);
            }
            Ok(())
        }

        fn program_tx_ring(&self) -> crate::error::Result<()> {
            let phys = hhdm::virt_to_phys(VirtAddr::new(self.tx_descriptors_ptr() as u64));
            // SAFETY: see `program_rx_ring`.
            unsafe {
                self.reg_write(REG_TDBAL, phys.as_u64() as u32);
                self.reg_write(REG_TDBAH, (phys.as_u64() >> 32) as u32);
                self.reg_write(REG_TDLEN, (NIC_RING_SIZE * core::mem::size_of::<TxDescriptor>()) as u32);
                self.reg_write(REG_TDH, 0);
                self.reg_write(REG_TDT, 0);
            }
            Ok(())
        }

        fn rx_descriptors_ptr(&self) -> *const RxDescriptor {
            self.rx.descriptors.as_ptr()
        }

        fn tx_descriptors_ptr(&self) -> *const TxDescriptor {
            self.tx.descriptors.as_ptr()
        }

        /// Queues `frame` for transmission, notifying the device of the new
        /// tail.
        pub fn send(&mut self, frame: &[u8]) -> Result<usize, NicError> {
            let (len, new_tail) = self.tx.send(frame)?;
            // SAFETY: register window is live.
            unsafe { self.reg_write(REG_TDT, new_tail as u32) };
            Ok(len)
        }

        /// Polls for a received frame, notifying the device of the
        /// reclaimed slot if one was found.
        pub fn recv(&mut self, buf: &mut [u8]) -> usize {
            let (n, reclaimed) = self.rx.recv(buf);
            if let Some(slot) = reclaimed {
                // SAFETY: register window is live.
                unsafe { self.reg_write(REG_RDT, slot as u32) };
            }
            n
        }
    }

    /// Carves `NIC_RING_SIZE` descriptors plus matching buffers for one
    /// ring out of the PFA, linking each descriptor to its buffer's
    /// physical address. Mirrors `sched::scheduler::carve_thread`'s
    /// no-heap-allocator approach to fixed-size kernel-owned storage.
    unsafe fn carve<D: Copy>(
        descriptor_init: D,
    ) -> crate::error::Result<(&'static mut [D], &'static mut [[u8; NIC_BUF_SIZE]])> {
        let desc_bytes = NIC_RING_SIZE * core::mem::size_of::<D>();
        let desc_frames = pmm::with(|a| {
            a.allocate_frames((desc_bytes as u64).div_ceil(crate::config::PAGE_SIZE) as usize)
        })?;
        let desc_virt = hhdm::phys_to_virt(desc_frames.start_address());
        // SAFETY: freshly allocated frames, exclusively owned, sized for
        // `NIC_RING_SIZE` descriptors.
        let descriptors = unsafe {
            let ptr = desc_virt.as_mut_ptr::<D>();
            for i in 0..NIC_RING_SIZE {
                ptr.add(i).write(descriptor_init);
            }
            core::slice::from_raw_parts_mut(ptr, NIC_RING_SIZE)
        };

        let buf_bytes = NIC_RING_SIZE * NIC_BUF_SIZE;
        let buf_frames = pmm::with(|a| {
            a.allocate_frames((buf_bytes as u64).div_ceil(crate::config::PAGE_SIZE) as usize)
        })?;
        let buf_virt = hhdm::phys_to_virt(buf_frames.start_address());
        // SAFETY: freshly allocated frames, exclusively owned, sized for
        // `NIC_RING_SIZE` buffers.
        let buffers = unsafe {
            core::slice::from_raw_parts_mut(
                buf_virt.as_mut_ptr::<[u8; NIC_BUF_SIZE]>(),
                NIC_RING_SIZE,
            )
        };

        let buf_phys_base = buf_frames.start_address().as_u64();
        for i in 0..NIC_RING_SIZE {
            let addr_field = descriptors_addr_mut(descriptors, i);
            *addr_field = buf_phys_base + (i * NIC_BUF_SIZE) as u64;
        }

        Ok((descriptors, buffers))
    }

    // Both descriptor layouts put `addr` as the first field; this helper
    // lets `carve` stay generic over RX/TX without a shared trait.
    fn descriptors_addr_mut<D>(descriptors: &mut [D], i: usize) -> &mut u64 {
        // SAFETY: `RxDescriptor` and `TxDescriptor` are both `#[repr(C)]`
        // with `addr: u64` as their first field.
        unsafe { &mut *(&mut descriptors[i] as *mut D as *mut u64) }
    }

    unsafe fn alloc_tx_ring() -> crate::error::Result<TxRing> {
        let zero = TxDescriptor { addr: 0, len: 0, cso: 0, cmd: 0, status: 0, css: 0, special: 0 };
        let (descriptors, buffers) = unsafe { carve(zero)? };
        // SAFETY: `descriptors`/`buffers` were just carved exclusively for
        // this ring and linked by `carve`.
        Ok(unsafe { TxRing::new(descriptors, buffers) })
    }

    unsafe fn alloc_rx_ring() -> crate::error::Result<RxRing> {
        let zero =
            RxDescriptor { addr: 0, len: 0, checksum: 0, status: 0, errors: 0, special: 0 };
        let (descriptors, buffers) = unsafe { carve(zero)? };
        // SAFETY: see `alloc_tx_ring`.
        Ok(unsafe { RxRing::new(descriptors, buffers) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_tx_ring(n: usize) -> TxRing {
        let descriptors: &'static mut [TxDescriptor] = Box::leak(
            vec![TxDescriptor { addr: 0, len: 0, cso: 0, cmd: 0, status: 0, css: 0, special: 0 }; n]
                .into_boxed_slice(),
        );
        let buffers: &'static mut [[u8; NIC_BUF_SIZE]] =
            Box::leak(vec![[0u8; NIC_BUF_SIZE]; n].into_boxed_slice());
        // SAFETY: host-only test fixture; both slices are leaked (never
        // freed, never aliased).
        unsafe { TxRing::new(descriptors, buffers) }
    }

    fn fresh_rx_ring(n: usize) -> RxRing {
        let descriptors: &'static mut [RxDescriptor] = Box::leak(
            vec![RxDescriptor { addr: 0, len: 0, checksum: 0, status: 0, errors: 0, special: 0 }; n]
                .into_boxed_slice(),
        );
        let buffers: &'static mut [[u8; NIC_BUF_SIZE]] =
            Box::leak(vec![[0u8; NIC_BUF_SIZE]; n].into_boxed_slice());
        // SAFETY: see `fresh_tx_ring`.
        unsafe { RxRing::new(descriptors, buffers) }
    }

    #[test]
    fn send_fills_ring_then_reports_full() {
        let mut tx = fresh_tx_ring(8);
        for _ in 0..8 {
            tx.send(&[0xAB; 64]).unwrap();
        }
        assert_eq!(tx.send(&[0xAB; 64]), Err(NicError::RingFull));
    }

    #[test]
    fn send_rejects_oversized_frame() {
        let mut tx = fresh_tx_ring(4);
        let oversized = vec![0u8; NIC_MTU + 1];
        assert_eq!(tx.send(&oversized), Err(NicError::BadLength));
    }

    #[test]
    fn mark_done_frees_slot_for_reuse() {
        let mut tx = fresh_tx_ring(2);
        tx.send(&[1; 10]).unwrap();
        let (_, slot) = tx.send(&[2; 10]).unwrap();
        assert_eq!(tx.send(&[3; 10]), Err(NicError::RingFull));
        tx.mark_done(0);
        tx.send(&[3; 10]).unwrap();
        let _ = slot;
    }

    #[test]
    fn recv_returns_nothing_until_arrival_simulated() {
        let mut rx = fresh_rx_ring(4);
        let mut buf = [0u8; 1500];
        assert_eq!(rx.recv(&mut buf), (0, None));

        rx.simulate_arrival(0, 42);
        let (n, reclaimed) = rx.recv(&mut buf);
        assert_eq!(n, 42);
        assert_eq!(reclaimed, Some(0));

        assert_eq!(rx.recv(&mut buf), (0, None));
    }

    #[test]
    fn recv_advances_cursor_across_slots() {
        let mut rx = fresh_rx_ring(3);
        let mut buf = [0u8; 64];
        rx.simulate_arrival(0, 10);
        rx.simulate_arrival(1, 20);
        assert_eq!(rx.recv(&mut buf).0, 10);
        assert_eq!(rx.recv(&mut buf).0, 20);
        assert_eq!(rx.recv(&mut buf), (0, None));
    }
}
