//! Synchronization primitives usable from `no_std`, interrupt-safe contexts.

mod lazy;
mod spinlock;

pub use lazy::LazyLock;
pub use spinlock::{SpinLock, SpinLockGuard, SpinLockIrqGuard};
