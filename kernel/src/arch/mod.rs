//! Architecture-specific glue. Only x86-64 is supported; a non-goal for
//! this kernel.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
