//! Thread Control Block and initial-stack-image construction.

use crate::config::{time_slice_ms, CPU_HISTORY_LEN, KERNEL_STACK_SIZE, PRIORITY_ADJUST_PERIOD};

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Terminated,
}

/// A thread's entry function: takes an opaque argument, returns an exit
/// code.
pub type EntryFn = fn(usize) -> i32;

/// Thread Control Block.
///
/// `rsp` is read/written by the naked `context_switch` routine at
/// [`crate::arch::x86_64::context::RSP_OFFSET`]; that constant is derived
/// from this struct with `offset_of!` and substituted directly into the
/// routine's operands, so reordering fields here can never desynchronize
/// the two.
#[repr(C)]
pub struct Tcb {
    pub tid: u32,
    pub state: ThreadState,
    pub kernel_stack_base: usize,
    pub kernel_stack_size: usize,
    pub rsp: usize,
    pub name: [u8; 32],
    pub entry: EntryFn,
    pub arg: usize,
    pub priority: u8,
    pub base_priority: u8,
    pub time_slice: u32,
    pub time_slice_length: u32,
    pub total_ticks: u64,
    pub cpu_usage_history: [u32; CPU_HISTORY_LEN],
    pub history_index: usize,
    pub avg_cpu_usage: u32,
    pub slices_since_adjust: u32,
    pub slice_start_ticks: u64,
    pub ticks_used_this_slice: u32,
    pub wake_time: u64,
    pub next: *mut Tcb,
    pub prev: *mut Tcb,
    pub exit_code: i32,
}

// SAFETY: a `Tcb` only ever has one owner at a time (the queue currently
// holding it, or the CPU currently running it); the scheduler serializes
// all access with `SpinLock::lock_irq`.
unsafe impl Send for Tcb {}

impl Tcb {
    /// Builds a TCB for a not-yet-run thread, writing the initial stack
    /// image (callee-saved registers zeroed, return address = `entry_point`,
    /// initial RFLAGS = `0x202`) at the top of `stack`.
    ///
    /// `stack` must be at least [`KERNEL_STACK_SIZE`] bytes and 16-byte
    /// aligned at its base; `entry_point` is the address the first
    /// `context_switch` into this thread will return into (the thread-entry
    /// trampoline on the real target; tests may pass any placeholder since
    /// they never actually resume into it).
    ///
    /// # Safety
    ///
    /// `stack` must be exclusively owned by this TCB for its entire
    /// lifetime (typically a PFA-backed allocation the caller just made).
    pub unsafe fn new(
        tid: u32,
        name: &str,
        entry: EntryFn,
        arg: usize,
        priority: u8,
        stack: &mut [u8],
        entry_point: usize,
    ) -> Self {
        assert!(stack.len() >= KERNEL_STACK_SIZE, "stack too small");
        let base = stack.as_mut_ptr() as usize;
        let top = base + stack.len();

        // Bottom-up order matching `context_switch`'s pop sequence (r15,
        // r14, r13, r12, rbx, rbp, then popfq, then `ret`): the saved rsp
        // points at `r15`, with `rflags` and the return address at the top
        // of this 8-word region.
        let words: [u64; 8] = [
            0,                  // r15
            0,                  // r14
            0,                  // r13
            0,                  // r12
            0,                  // rbx
            0,                  // rbp
            0x202,              // rflags: IF=1, reserved bit 1 set
            entry_point as u64, // return address for `ret`
        ];
        let mut sp = top;
        for w in words.iter().rev() {
            sp -= 8;
            // SAFETY: `sp` stays within `[base, top)` since `words.len() * 8
            // <= KERNEL_STACK_SIZE`, and this TCB exclusively owns `stack`.
            unsafe { (sp as *mut u64).write(*w) };
        }

        Self {
            tid,
            state: ThreadState::Created,
            kernel_stack_base: base,
            kernel_stack_size: stack.len(),
            rsp: sp,
            name: name_bytes(name),
            entry,
            arg,
            priority,
            base_priority: priority,
            time_slice: time_slice_ms(priority),
            time_slice_length: time_slice_ms(priority),
            total_ticks: 0,
            cpu_usage_history: [0; CPU_HISTORY_LEN],
            history_index: 0,
            avg_cpu_usage: 0,
            slices_since_adjust: 0,
            slice_start_ticks: 0,
            ticks_used_this_slice: 0,
            wake_time: 0,
            next: core::ptr::null_mut(),
            prev: core::ptr::null_mut(),
            exit_code: 0,
        }
    }

    /// Records a completed slice's usage percentage into the moving-average
    /// history and recomputes the average.
    pub fn record_slice_usage(&mut self, used_pct: u32) {
        self.cpu_usage_history[self.history_index % CPU_HISTORY_LEN] = used_pct;
        self.history_index = self.history_index.wrapping_add(1);
        let n = self.history_index.min(CPU_HISTORY_LEN).max(1) as u32;
        let sum: u32 = self.cpu_usage_history.iter().take(n as usize).sum();
        self.avg_cpu_usage = sum / n;
    }

    /// Counts a completed slice toward the adaptive-priority gate and
    /// reports whether this is the `PRIORITY_ADJUST_PERIOD`th one, resetting
    /// the counter when it is. The caller only re-evaluates priority on a
    /// `true` result, so a saturated thread demotes once per period rather
    /// than once per slice.
    pub fn should_adjust_priority(&mut self) -> bool {
        self.slices_since_adjust = self.slices_since_adjust.wrapping_add(1);
        if self.slices_since_adjust >= PRIORITY_ADJUST_PERIOD {
            self.slices_since_adjust = 0;
            true
        } else {
            false
        }
    }
}

fn name_bytes(name: &str) -> [u8; 32] {
    let mut buf = [0u8; 32];
    let bytes = name.as_bytes();
    let len = bytes.len().min(31);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_entry(_: usize) -> i32 {
        0
    }

    #[test]
    fn stack_image_return_address_is_entry_point() {
        let mut stack = vec![0u8; KERNEL_STACK_SIZE];
        // SAFETY: `stack` is exclusively owned by this test.
        let tcb = unsafe { Tcb::new(1, "t", noop_entry, 0, 3, &mut stack, 0xDEAD_BEEF) };
        // SAFETY: `tcb.rsp` was written by `Tcb::new` above and still
        // points into `stack`, which is still alive.
        let saved_ret = unsafe { *((tcb.rsp + 7 * 8) as *const u64) };
        assert_eq!(saved_ret, 0xDEAD_BEEF);
        let saved_flags = unsafe { *((tcb.rsp + 6 * 8) as *const u64) };
        assert_eq!(saved_flags, 0x202);
    }

    #[test]
    fn name_truncates_and_nul_pads() {
        let long = "a-very-long-thread-name-that-overflows-the-buffer";
        let buf = name_bytes(long);
        assert_eq!(&buf[..31], &long.as_bytes()[..31]);
        assert_eq!(buf[31], 0);
    }

    #[test]
    fn moving_average_tracks_recent_slices() {
        let mut stack = vec![0u8; KERNEL_STACK_SIZE];
        // SAFETY: see above.
        let mut tcb = unsafe { Tcb::new(2, "t", noop_entry, 0, 3, &mut stack, 0) };
        for _ in 0..CPU_HISTORY_LEN {
            tcb.record_slice_usage(100);
        }
        assert_eq!(tcb.avg_cpu_usage, 100);
        tcb.record_slice_usage(0);
        // One of eight samples is now 0; average drops but doesn't collapse.
        assert!(tcb.avg_cpu_usage < 100 && tcb.avg_cpu_usage >= 80);
    }

    #[test]
    fn adjust_priority_gate_fires_every_eighth_slice() {
        let mut stack = vec![0u8; KERNEL_STACK_SIZE];
        // SAFETY: see above.
        let mut tcb = unsafe { Tcb::new(3, "t", noop_entry, 0, 3, &mut stack, 0) };
        for _ in 0..7 {
            assert!(!tcb.should_adjust_priority());
        }
        assert!(tcb.should_adjust_priority());
        for _ in 0..7 {
            assert!(!tcb.should_adjust_priority());
        }
        assert!(tcb.should_adjust_priority());
    }
}
