//! Shared error types for the memory and scheduling core.

use core::fmt;

/// Errors produced by the frame allocator and virtual memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The physical frame allocator has no free frames (or no run of `n`
    /// contiguous free frames) left.
    OutOfMemory,
    /// A page-table walk hit a non-present entry before reaching a leaf.
    NotMapped,
    /// An address passed to a page-granular operation was not page-aligned.
    Misaligned,
    /// A bump-allocated virtual region (MMIO window, kernel stack pool) has
    /// no room left.
    RegionExhausted,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::NotMapped => "address not mapped",
            Self::Misaligned => "address not page-aligned",
            Self::RegionExhausted => "virtual region exhausted",
        };
        f.write_str(msg)
    }
}

/// Errors local to the NIC driver; not meaningful to allocator/VMM callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicError {
    /// `send` was called while the current TX descriptor is still owned by
    /// hardware (`DD` bit clear).
    RingFull,
    /// A frame larger than the driver's MTU was passed to `send`.
    BadLength,
}

impl fmt::Display for NicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::RingFull => "tx ring full",
            Self::BadLength => "frame exceeds mtu",
        };
        f.write_str(msg)
    }
}

/// Convenience alias matching the rest of the crate's `Result<T, KernelError>`.
pub type Result<T> = core::result::Result<T, KernelError>;
