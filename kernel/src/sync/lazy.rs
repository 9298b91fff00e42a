//! A `no_std` lazily-initialized static, for process-wide singletons (IDT,
//! GDT, scheduler) whose construction needs code to run, not just a `const`.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const POISONED: u8 = 3;

/// A value initialized on first access by calling `F` exactly once.
pub struct LazyLock<T, F = fn() -> T> {
    state: AtomicU8,
    init: UnsafeCell<Option<F>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: access is serialized through the `state` atomic; `T: Sync` and
// `F: Send` are required because initialization may run on whichever thread
// first touches the value.
unsafe impl<T: Sync, F: Send> Sync for LazyLock<T, F> {}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    /// Creates a `LazyLock` that will call `init` on first access.
    pub const fn new(init: F) -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            init: UnsafeCell::new(Some(init)),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Forces initialization (if not already done) and returns a reference
    /// to the value.
    ///
    /// # Panics
    ///
    /// Panics if a previous initialization attempt panicked (poisoned), or
    /// if called reentrantly from within the initializer itself.
    pub fn force(&self) -> &T {
        loop {
            match self.state.compare_exchange(
                UNINIT,
                INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let _guard = InitGuard { state: &self.state };
                    // SAFETY: we hold the only INITIALIZING claim; no other
                    // accessor observes `value`/`init` until READY is stored.
                    let f = unsafe { (*self.init.get()).take() }
                        .expect("LazyLock initializer missing");
                    let v = f();
                    // SAFETY: exclusive access established above.
                    unsafe { (*self.value.get()).write(v) };
                    _guard.disarm();
                    self.state.store(READY, Ordering::Release);
                }
                Err(READY) => {
                    // SAFETY: READY means `value` was written and will not
                    // be mutated again.
                    return unsafe { (*self.value.get()).assume_init_ref() };
                }
                Err(INITIALIZING) => core::hint::spin_loop(),
                Err(POISONED) => panic!("LazyLock: poisoned by a previous panic"),
                Err(_) => unreachable!(),
            }
            if self.state.load(Ordering::Acquire) == READY {
                // SAFETY: see above.
                return unsafe { (*self.value.get()).assume_init_ref() };
            }
        }
    }
}

impl<T, F: FnOnce() -> T> core::ops::Deref for LazyLock<T, F> {
    type Target = T;
    fn deref(&self) -> &T {
        self.force()
    }
}

struct InitGuard<'a> {
    state: &'a AtomicU8,
}

impl InitGuard<'_> {
    fn disarm(self) {
        core::mem::forget(self);
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        // Only reached if `f()` above panicked.
        self.state.store(POISONED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    #[test]
    fn initializes_once() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let lazy = LazyLock::new(|| {
            CALLS.fetch_add(1, Ordering::Relaxed);
            7
        });
        assert_eq!(*lazy, 7);
        assert_eq!(*lazy, 7);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic(expected = "poisoned")]
    fn poisons_on_panic() {
        let lazy: LazyLock<i32, _> = LazyLock::new(|| panic!("boom"));
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = &*lazy;
        }));
        let _ = &*lazy;
    }
}
