//! Spin-based mutual exclusion lock.
//!
//! Uses test-and-test-and-set (TTAS) to reduce cache-line contention.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spin-based mutual exclusion lock, const-constructable so it can be
/// placed in `static` items.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the lock's atomic `compare_exchange` ensures exclusive access to
// `T`; `T: Send` is required because the data may cross thread/interrupt
// contexts.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Acquires the lock with interrupts disabled for the critical section.
    ///
    /// Records whether interrupts were enabled on entry and restores that
    /// state when the returned guard is dropped. Use this for any lock an
    /// interrupt handler might also need, to avoid a handler deadlocking
    /// against itself on the same CPU.
    pub fn lock_irq(&self) -> SpinLockIrqGuard<'_, T> {
        let was_enabled = arch_irq::are_enabled();
        arch_irq::disable();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockIrqGuard {
                    lock: self,
                    restore_irq: was_enabled,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the underlying data without acquiring
    /// the lock.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other code is concurrently accessing the
    /// data. Intended as a last-resort escape hatch (e.g. a panic handler).
    pub unsafe fn force_get(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

/// RAII guard releasing the [`SpinLock`] when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// RAII guard releasing the [`SpinLock`] and restoring the prior interrupt
/// flag state when dropped.
pub struct SpinLockIrqGuard<'a, T> {
    lock: &'a SpinLock<T>,
    restore_irq: bool,
}

impl<T> Deref for SpinLockIrqGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockIrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockIrqGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.restore_irq {
            arch_irq::enable();
        }
    }
}

/// Interrupt-flag control, isolated so [`SpinLock::lock_irq`] stays portable
/// across the real kernel target and the host test target.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch_irq {
    use core::arch::asm;

    pub fn are_enabled() -> bool {
        let flags: u64;
        // SAFETY: `pushfq`/`pop` only reads RFLAGS, no side effects.
        unsafe {
            asm!("pushfq", "pop {}", out(reg) flags, options(nomem, preserves_flags));
        }
        flags & (1 << 9) != 0
    }

    pub fn disable() {
        // SAFETY: `cli` has no side effects beyond clearing IF.
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    pub fn enable() {
        // SAFETY: `sti` has no side effects beyond setting IF.
        unsafe { asm!("sti", options(nomem, nostack)) };
    }
}

/// Host fallback: there is no real interrupt flag to manipulate in a hosted
/// `cargo test` process, so this tracks a process-local flag instead. This
/// is enough to exercise [`SpinLock::lock_irq`]'s bookkeeping in tests.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch_irq {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(true);

    pub fn are_enabled() -> bool {
        ENABLED.load(Ordering::Relaxed)
    }

    pub fn disable() {
        ENABLED.store(false, Ordering::Relaxed);
    }

    pub fn enable() {
        ENABLED.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock() {
        let lock = SpinLock::new(42);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 42);
        }
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = SpinLock::new(10);
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn mutate_through_guard() {
        let lock = SpinLock::new(0);
        {
            let mut guard = lock.lock();
            *guard = 99;
        }
        assert_eq!(*lock.lock(), 99);
    }

    // The host `arch_irq` shim is a single process-wide flag, so both cases
    // below run in one test to avoid racing against other tests in this
    // file that run concurrently under the default test harness.
    #[test]
    fn lock_irq_save_restore() {
        let lock = SpinLock::new(0);

        arch_irq::enable();
        {
            let _guard = lock.lock_irq();
            assert!(!arch_irq::are_enabled());
        }
        assert!(arch_irq::are_enabled());

        arch_irq::disable();
        {
            let _guard = lock.lock_irq();
            assert!(!arch_irq::are_enabled());
        }
        assert!(!arch_irq::are_enabled());
        arch_irq::enable();
    }
}
