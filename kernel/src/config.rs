//! Centralised tunables referenced by more than one module.

/// Page size in bytes. The only size this kernel manages (no huge pages).
pub const PAGE_SIZE: u64 = 4096;

/// PIT tick frequency in Hz. One tick equals one millisecond.
pub const TICK_HZ: u32 = 1000;

/// Base of the bump-allocated MMIO virtual window.
pub const MMIO_BASE: u64 = 0xFFFF_FFFF_C000_0000;

/// Physical range treated as MMIO for the page-fault rescue policy.
pub const MMIO_FAULT_RANGE: core::ops::Range<u64> = 0xE000_0000..0x1_0000_0000;

/// Number of scheduler priority levels (0 = realtime, highest - 1 = idle).
pub const PRIORITY_LEVELS: u8 = 7;

/// Threads at or below this priority never get demoted past it by the
/// adaptive policy; realtime (0) and idle (`PRIORITY_LEVELS - 1`) never
/// adjust at all.
pub const PRIORITY_LOW: u8 = 5;

/// Priority assigned to the always-present idle thread.
pub const PRIORITY_IDLE: u8 = PRIORITY_LEVELS - 1;

/// Base component of a thread's time-slice length, in ticks (ms, since
/// `TICK_HZ` is 1000).
pub const TIME_SLICE_BASE_MS: u32 = 10;

/// Number of completed-slice samples averaged for the adaptive priority
/// decision.
pub const CPU_HISTORY_LEN: usize = 8;

/// Number of completed slices between adaptive priority re-evaluations.
/// Shares its value with `CPU_HISTORY_LEN`: each re-evaluation judges a
/// thread against the average over the window it just finished filling.
pub const PRIORITY_ADJUST_PERIOD: u32 = CPU_HISTORY_LEN as u32;

/// CPU-usage percentage above which a thread is a demotion candidate.
pub const DEMOTE_THRESHOLD_PCT: u32 = 80;

/// CPU-usage percentage below which a thread is a promotion candidate.
pub const PROMOTE_THRESHOLD_PCT: u32 = 30;

/// Number of descriptors in the NIC's RX and TX rings.
pub const NIC_RING_SIZE: usize = 256;

/// Per-buffer size for NIC RX/TX descriptors.
pub const NIC_BUF_SIZE: usize = 2048;

/// Maximum Ethernet frame length this driver will transmit.
pub const NIC_MTU: usize = 1514;

/// Kernel stack size for each thread.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Computes a thread's time-slice length from its current priority.
#[inline]
pub const fn time_slice_ms(priority: u8) -> u32 {
    TIME_SLICE_BASE_MS + (PRIORITY_LEVELS as u32 - priority as u32) * 3
}
