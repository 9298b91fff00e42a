//! Programmable Interval Timer: channel 0, mode 3, as the kernel's primary
//! tick source (1 kHz by default).

use core::sync::atomic::{AtomicU64, Ordering};

use super::port::Port;
use crate::config::TICK_HZ;

const PIT_FREQUENCY: u32 = 1_193_182;
const CHANNEL0_DATA: Port<u8> = Port::new(0x40);
const PIT_CMD: Port<u8> = Port::new(0x43);

/// Command byte: channel 0, lo/hi byte access, mode 3 (square wave), binary.
const CMD_CHANNEL0_MODE3: u8 = 0b0011_0110;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Programs PIT channel 0 for a periodic interrupt at `TICK_HZ`.
///
/// # Safety
///
/// Must run once, early in boot, with the PIC remapped and IRQ0 still
/// masked (unmask only after the tick handler is registered).
pub unsafe fn init() {
    let divisor = (PIT_FREQUENCY / TICK_HZ) as u16;
    // SAFETY: standard PIT programming sequence.
    unsafe {
        PIT_CMD.write(CMD_CHANNEL0_MODE3);
        CHANNEL0_DATA.write((divisor & 0xFF) as u8);
        CHANNEL0_DATA.write((divisor >> 8) as u8);
    }
    crate::kdebug!("pit: programmed for {} Hz", TICK_HZ);
}

/// Called from the IRQ0 handler. Increments the monotonic tick counter and
/// returns its new value.
pub fn on_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Current tick count since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Busy-waits (in a `hlt` loop) until at least `ms` milliseconds have
/// elapsed, as measured by the tick counter.
///
/// # Safety
///
/// Must only be called with interrupts enabled (otherwise `ticks()` never
/// advances and this spins forever).
pub unsafe fn sleep_ms_busy(ms: u64) {
    let target = ticks() + ms * u64::from(TICK_HZ) / 1000;
    while ticks() < target {
        // SAFETY: `hlt` only pauses the CPU until the next interrupt.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}
