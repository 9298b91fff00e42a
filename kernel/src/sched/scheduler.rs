//! Preemptive multi-level priority scheduler.
//!
//! Ready, sleep, and blocked queues are threaded through `Tcb::next`/`prev` —
//! no allocation happens on the scheduling path. The pure queue/priority
//! logic in [`SchedulerState`] is host-testable on its own; [`init`]/[`spawn`]
//! and friends wrap it with the global singleton and (on the real target)
//! the arch-level `context_switch`.

use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{
    time_slice_ms, PAGE_SIZE, PRIORITY_IDLE, PRIORITY_LEVELS, PRIORITY_LOW,
    DEMOTE_THRESHOLD_PCT, KERNEL_STACK_SIZE, PROMOTE_THRESHOLD_PCT,
};
use crate::error::Result;
use crate::mm::{hhdm, pmm};
use crate::sched::thread::{EntryFn, Tcb, ThreadState};
use crate::sync::SpinLock;

/// Intrusive FIFO queue threaded through `Tcb::next`/`prev`.
#[derive(Clone, Copy)]
struct Queue {
    head: *mut Tcb,
    tail: *mut Tcb,
}

impl Queue {
    const fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// # Safety
    /// `tcb` must be a valid, live `Tcb` not currently linked into any queue.
    unsafe fn push_back(&mut self, tcb: *mut Tcb) {
        unsafe {
            (*tcb).next = ptr::null_mut();
            (*tcb).prev = self.tail;
            if self.tail.is_null() {
                self.head = tcb;
            } else {
                (*self.tail).next = tcb;
            }
            self.tail = tcb;
        }
    }

    /// # Safety
    /// Every node reachable from `self.head` must be a valid, live `Tcb`.
    unsafe fn pop_front(&mut self) -> *mut Tcb {
        let front = self.head;
        if front.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            let next = (*front).next;
            self.head = next;
            if next.is_null() {
                self.tail = ptr::null_mut();
            } else {
                (*next).prev = ptr::null_mut();
            }
            (*front).next = ptr::null_mut();
            (*front).prev = ptr::null_mut();
        }
        front
    }

    /// # Safety
    /// `tcb` must currently be linked into this queue.
    unsafe fn remove(&mut self, tcb: *mut Tcb) {
        unsafe {
            let prev = (*tcb).prev;
            let next = (*tcb).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
            (*tcb).next = ptr::null_mut();
            (*tcb).prev = ptr::null_mut();
        }
    }
}

/// Pure scheduling state: ready queues, sleep queue, blocked queue, and the
/// currently running thread. Deliberately ignorant of the global singleton
/// and the real `context_switch` so its policy can be driven directly from
/// tests.
pub struct SchedulerState {
    ready: [Queue; PRIORITY_LEVELS as usize],
    sleeping_head: *mut Tcb,
    blocked: Queue,
    current: *mut Tcb,
    idle: *mut Tcb,
    ticks: u64,
}

// SAFETY: every pointer this struct holds is either null or a `Tcb` whose
// exclusive owner is whichever queue (or `current`) holds it; access is
// always serialized through `SpinLock::lock_irq` by the global singleton,
// or single-threaded in tests.
unsafe impl Send for SchedulerState {}

impl SchedulerState {
    /// Builds a fresh scheduler with `idle` as the sole runnable thread.
    ///
    /// # Safety
    /// `idle` must be a valid, live `Tcb` that outlives the `SchedulerState`.
    pub unsafe fn new(idle: *mut Tcb) -> Self {
        unsafe { (*idle).state = ThreadState::Running };
        Self {
            ready: [Queue::empty(); PRIORITY_LEVELS as usize],
            sleeping_head: ptr::null_mut(),
            blocked: Queue::empty(),
            current: idle,
            idle,
            ticks: 0,
        }
    }

    pub fn current(&self) -> *mut Tcb {
        self.current
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Marks `tcb` Ready, resets its slice accounting, and enqueues it at the
    /// tail of its current priority.
    ///
    /// # Safety
    /// `tcb` must be a valid, live `Tcb` not currently linked into any queue.
    pub unsafe fn make_ready(&mut self, tcb: *mut Tcb) {
        unsafe {
            (*tcb).state = ThreadState::Ready;
            (*tcb).time_slice = (*tcb).time_slice_length;
            (*tcb).ticks_used_this_slice = 0;
            let p = (*tcb).priority as usize;
            self.ready[p].push_back(tcb);
        }
    }

    fn pick_next(&mut self) -> *mut Tcb {
        for p in 0..PRIORITY_LEVELS as usize {
            if !self.ready[p].is_empty() {
                // SAFETY: every TCB ever pushed into `self.ready` is live for
                // the scheduler's entire lifetime.
                return unsafe { self.ready[p].pop_front() };
            }
        }
        self.idle
    }

    /// Wakes every sleeper whose `wake_time <= self.ticks`, moving it to
    /// Ready. Sleepers are kept sorted ascending by `wake_time`, so this
    /// stops at the first one still in the future.
    fn wake_due_sleepers(&mut self) {
        while !self.sleeping_head.is_null() {
            // SAFETY: every node on the sleep list is a live TCB.
            let due = unsafe { (*self.sleeping_head).wake_time } <= self.ticks;
            if !due {
                break;
            }
            let woke = self.sleeping_head;
            // SAFETY: see above.
            unsafe {
                self.sleeping_head = (*woke).next;
                (*woke).next = ptr::null_mut();
                self.make_ready(woke);
            }
        }
    }

    /// Sorted insert, ascending by `wake_time`, ties broken FIFO.
    ///
    /// # Safety
    /// `tcb` must be a valid, live `Tcb` not currently linked into any queue.
    unsafe fn sleeping_insert(&mut self, tcb: *mut Tcb) {
        unsafe {
            (*tcb).next = ptr::null_mut();
            (*tcb).prev = ptr::null_mut();
            if self.sleeping_head.is_null() || (*self.sleeping_head).wake_time > (*tcb).wake_time {
                (*tcb).next = self.sleeping_head;
                self.sleeping_head = tcb;
                return;
            }
            let mut node = self.sleeping_head;
            while !(*node).next.is_null() && (*(*node).next).wake_time <= (*tcb).wake_time {
                node = (*node).next;
            }
            (*tcb).next = (*node).next;
            (*node).next = tcb;
        }
    }

    /// Adaptive priority step for a thread whose `Tcb::should_adjust_priority`
    /// gate just fired (i.e. once every `PRIORITY_ADJUST_PERIOD` completed
    /// slices, not every slice). Realtime (`base_priority == 0`) and idle
    /// never adjust.
    ///
    /// # Safety
    /// `tcb` must be a valid, live `Tcb`.
    unsafe fn adjust_priority(&mut self, tcb: *mut Tcb) {
        unsafe {
            if (*tcb).base_priority == 0 || (*tcb).base_priority == PRIORITY_IDLE {
                return;
            }
            let u = (*tcb).avg_cpu_usage;
            if u > DEMOTE_THRESHOLD_PCT && (*tcb).priority < PRIORITY_LOW {
                (*tcb).priority += 1;
            } else if u < PROMOTE_THRESHOLD_PCT && (*tcb).priority > (*tcb).base_priority {
                (*tcb).priority -= 1;
            }
            (*tcb).time_slice_length = time_slice_ms((*tcb).priority);
        }
    }

    /// Advances the tick counter, wakes due sleepers, and charges the
    /// current thread one tick. Returns `Some((old, new))` if the current
    /// thread's slice expired and a new thread was picked, else `None`.
    ///
    /// # Safety
    /// The scheduler must have a valid `current` thread (true after [`new`]).
    pub unsafe fn tick(&mut self) -> Option<(*mut Tcb, *mut Tcb)> {
        self.ticks += 1;
        self.wake_due_sleepers();

        let cur = self.current;
        unsafe {
            (*cur).total_ticks += 1;
            (*cur).ticks_used_this_slice += 1;
            if (*cur).time_slice > 0 {
                (*cur).time_slice -= 1;
            }
            if (*cur).time_slice != 0 {
                return None;
            }
            if cur == self.idle {
                // The idle thread's "slice" never really ends; just reset
                // its countdown and keep it current.
                (*cur).time_slice = (*cur).time_slice_length;
                return None;
            }

            (*cur).record_slice_usage(100);
            if (*cur).should_adjust_priority() {
                self.adjust_priority(cur);
            }
            self.make_ready(cur);
            let next = self.pick_next();
            (*next).state = ThreadState::Running;
            self.current = next;
            Some((cur, next))
        }
    }

    /// Voluntary yield: re-averages the partial slice, re-adjusts priority
    /// every `PRIORITY_ADJUST_PERIOD`th completed slice, requeues the
    /// current thread, and picks the next one.
    ///
    /// # Safety
    /// The scheduler must have a valid `current` thread.
    pub unsafe fn do_yield(&mut self) -> (*mut Tcb, *mut Tcb) {
        let cur = self.current;
        unsafe {
            let used_pct = if (*cur).time_slice_length > 0 {
                ((*cur).ticks_used_this_slice * 100) / (*cur).time_slice_length
            } else {
                0
            };
            (*cur).record_slice_usage(used_pct);
            if (*cur).should_adjust_priority() {
                self.adjust_priority(cur);
            }
            self.make_ready(cur);
            let next = self.pick_next();
            (*next).state = ThreadState::Running;
            self.current = next;
            (cur, next)
        }
    }

    /// # Safety
    /// The scheduler must have a valid `current` thread.
    pub unsafe fn do_sleep(&mut self, ms: u32) -> (*mut Tcb, *mut Tcb) {
        let cur = self.current;
        unsafe {
            (*cur).wake_time = self.ticks + ms as u64;
            (*cur).state = ThreadState::Sleeping;
            self.sleeping_insert(cur);
            let next = self.pick_next();
            (*next).state = ThreadState::Running;
            self.current = next;
            (cur, next)
        }
    }

    /// # Safety
    /// The scheduler must have a valid `current` thread.
    pub unsafe fn do_block(&mut self) -> (*mut Tcb, *mut Tcb) {
        let cur = self.current;
        unsafe {
            (*cur).state = ThreadState::Blocked;
            self.blocked.push_back(cur);
            let next = self.pick_next();
            (*next).state = ThreadState::Running;
            self.current = next;
            (cur, next)
        }
    }

    /// Moves a blocked thread back to Ready.
    ///
    /// # Safety
    /// `tcb` must currently be linked into the blocked queue.
    pub unsafe fn unblock(&mut self, tcb: *mut Tcb) {
        unsafe {
            self.blocked.remove(tcb);
            self.make_ready(tcb);
        }
    }

    /// Terminates the current thread and picks the next one. The TCB is not
    /// reclaimed (no reaper in v1 — see `DESIGN.md`).
    ///
    /// # Safety
    /// The scheduler must have a valid `current` thread.
    pub unsafe fn do_exit(&mut self, code: i32) -> (*mut Tcb, *mut Tcb) {
        let cur = self.current;
        unsafe {
            (*cur).exit_code = code;
            (*cur).state = ThreadState::Terminated;
            let next = self.pick_next();
            (*next).state = ThreadState::Running;
            self.current = next;
            (cur, next)
        }
    }
}

static SCHEDULER: SpinLock<Option<SchedulerState>> = SpinLock::new(None);
static NEXT_TID: AtomicU32 = AtomicU32::new(1);

fn with_locked<R>(f: impl FnOnce(&mut SchedulerState) -> R) -> R {
    let mut guard = SCHEDULER.lock_irq();
    f(guard.as_mut().expect("scheduler not initialized"))
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn trampoline_addr() -> usize {
    crate::arch::x86_64::context::thread_entry_trampoline as usize
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn trampoline_addr() -> usize {
    // Host tests never actually resume into a thread's first run; `Tcb::new`
    // only needs *some* return address to write into the stack image.
    0
}

fn idle_entry(_: usize) -> i32 {
    loop {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: `sti; hlt` only pauses the CPU until the next interrupt.
        unsafe {
            core::arch::asm!("sti", "hlt", options(nomem, nostack))
        };
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        core::hint::spin_loop();
    }
}

/// Carves a TCB and its kernel stack out of PFA-backed, HHDM-mapped memory.
/// There is no heap allocator in this kernel: the `Tcb` itself lives at the
/// bottom of the same frames that back the thread's stack.
fn carve_thread(name: &str, entry: EntryFn, arg: usize, priority: u8) -> Result<*mut Tcb> {
    assert!(priority < PRIORITY_LEVELS, "priority out of range");

    let tcb_space = core::mem::size_of::<Tcb>().next_multiple_of(16);
    let total_len = (KERNEL_STACK_SIZE + tcb_space).next_multiple_of(PAGE_SIZE as usize);
    let frames = total_len as u64 / PAGE_SIZE;

    let frame = pmm::with(|a| a.allocate_frames(frames as usize))?;
    let virt = hhdm::phys_to_virt(frame.start_address()).as_u64();
    let block = virt as *mut u8;

    // SAFETY: `block..block+total_len` is freshly PFA-allocated, HHDM-mapped
    // memory nothing else has claimed; `stack_slice` covers the portion
    // after the TCB's own footprint.
    let stack_slice =
        unsafe { core::slice::from_raw_parts_mut(block.add(tcb_space), total_len - tcb_space) };

    let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    // SAFETY: `stack_slice` is exclusively owned by the TCB under
    // construction for the rest of its lifetime.
    let tcb = unsafe { Tcb::new(tid, name, entry, arg, priority, stack_slice, trampoline_addr()) };
    let tcb_ptr = block as *mut Tcb;
    // SAFETY: `tcb_ptr` points at `tcb_space` bytes of the same allocation,
    // large enough (by construction above) to hold a `Tcb`.
    unsafe { tcb_ptr.write(tcb) };
    Ok(tcb_ptr)
}

/// Installs the global scheduler with a fresh idle thread. Must be called
/// exactly once, after the PFA and HHDM are initialized.
pub fn init() -> Result<()> {
    let idle = carve_thread("idle", idle_entry, 0, PRIORITY_IDLE)?;
    // SAFETY: `idle` was just constructed and is not yet visible to anyone.
    let state = unsafe { SchedulerState::new(idle) };
    *SCHEDULER.lock_irq() = Some(state);
    Ok(())
}

/// Creates a new thread and adds it to the ready queue at `priority`.
pub fn spawn(name: &str, entry: EntryFn, arg: usize, priority: u8) -> Result<*mut Tcb> {
    let tcb = carve_thread(name, entry, arg, priority)?;
    // SAFETY: `tcb` was just constructed and is not linked into any queue.
    with_locked(|s| unsafe { s.make_ready(tcb) });
    Ok(tcb)
}

pub fn current() -> *mut Tcb {
    with_locked(|s| s.current())
}

pub fn ticks() -> u64 {
    with_locked(|s| s.ticks())
}

/// # Safety
/// Must only be called from the context of the currently running thread
/// (i.e. from [`crate::arch::x86_64::context::thread_entry_trampoline`]).
pub unsafe fn current_entry_and_arg() -> (EntryFn, usize) {
    let cur = current();
    // SAFETY: `cur` is always a valid, live TCB while the scheduler runs it.
    unsafe { ((*cur).entry, (*cur).arg) }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch_glue {
    use super::*;
    use crate::arch::x86_64::context::context_switch;

    fn switch_if_needed(old: *mut Tcb, new: *mut Tcb) {
        if old != new {
            // SAFETY: both point at live TCBs owned by the scheduler; `old`
            // is the thread making this call, `new` is what it picked.
            unsafe { context_switch(old, new) };
        }
    }

    /// Performs the PIT tick callback: scheduler bookkeeping, then an actual
    /// context switch if the current thread's slice expired.
    pub fn on_tick() {
        let switched = with_locked(|s| unsafe { s.tick() });
        if let Some((old, new)) = switched {
            switch_if_needed(old, new);
        }
    }

    pub fn yield_now() {
        let (old, new) = with_locked(|s| unsafe { s.do_yield() });
        switch_if_needed(old, new);
    }

    pub fn sleep_ms(ms: u32) {
        let (old, new) = with_locked(|s| unsafe { s.do_sleep(ms) });
        switch_if_needed(old, new);
    }

    pub fn block() {
        let (old, new) = with_locked(|s| unsafe { s.do_block() });
        switch_if_needed(old, new);
    }

    pub fn unblock(tcb: *mut Tcb) {
        // SAFETY: callers hand back a pointer this module previously gave
        // them via `spawn`, currently sitting in the blocked queue.
        with_locked(|s| unsafe { s.unblock(tcb) });
    }

    /// # Safety
    /// Must only be called from [`super::super::context::thread_entry_trampoline`].
    pub unsafe fn exit_current(code: i32) -> ! {
        let (old, new) = with_locked(|s| unsafe { s.do_exit(code) });
        // SAFETY: `new` is a live TCB the scheduler just picked; this call
        // never returns because `old`'s TCB is never resumed again.
        unsafe { context_switch(old, new) };
        unreachable!("a terminated thread's context is never resumed")
    }

    /// Performs the one-way switch from a bootstrap context into the first
    /// scheduled thread. Never returns.
    pub unsafe fn start() -> ! {
        let first = with_locked(|s| s.current());
        let mut bootstrap = core::mem::MaybeUninit::<Tcb>::zeroed();
        // SAFETY: `bootstrap`'s saved state is discarded forever; `first` is
        // the scheduler's current thread (the idle thread, just after
        // `init`, unless `spawn` already picked something higher-priority).
        unsafe { context_switch(bootstrap.as_mut_ptr(), first) };
        unreachable!("scheduler threads never return to the bootstrap context")
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use arch_glue::*;

/// # Safety
/// Must only be called from [`crate::arch::x86_64::context::thread_entry_trampoline`].
pub unsafe fn exit_current(code: i32) -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: forwarded from this function's own contract.
    unsafe {
        arch_glue::exit_current(code)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    unreachable!("thread_entry_trampoline only exists on the real kernel target")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_entry(_: usize) -> i32 {
        0
    }

    fn make_tcb(tid: u32, name: &str, priority: u8) -> *mut Tcb {
        let stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let stack: &'static mut [u8] = Box::leak(stack);
        // SAFETY: `stack` is leaked for the process lifetime, exclusively
        // owned by this TCB.
        let tcb = unsafe { Tcb::new(tid, name, noop_entry, 0, priority, stack, 0) };
        Box::into_raw(Box::new(tcb))
    }

    fn make_scheduler(priority: u8) -> (SchedulerState, *mut Tcb) {
        let idle = make_tcb(0, "idle", PRIORITY_IDLE);
        // SAFETY: `idle` freshly built above, not linked into any queue.
        let sched = unsafe { SchedulerState::new(idle) };
        let _ = priority;
        (sched, idle)
    }

    #[test]
    fn strict_priority_preempts_lower_numbered_queue() {
        let (mut sched, _idle) = make_scheduler(0);
        let low = make_tcb(1, "low", 4);
        let high = make_tcb(2, "high", 1);
        // SAFETY: freshly built, unlinked TCBs.
        unsafe {
            sched.make_ready(low);
            sched.make_ready(high);
        }
        // The idle thread is current; a tick forces a pick even without
        // idle's slice expiring, via direct `pick_next` behavior: the next
        // non-idle schedule must prefer priority 1 over priority 4.
        let next = sched.pick_next();
        assert_eq!(next, high);
    }

    #[test]
    fn round_robin_within_a_priority() {
        let (mut sched, _idle) = make_scheduler(0);
        let a = make_tcb(1, "a", 3);
        let b = make_tcb(2, "b", 3);
        let c = make_tcb(3, "c", 3);
        // SAFETY: freshly built, unlinked TCBs.
        unsafe {
            sched.make_ready(a);
            sched.make_ready(b);
            sched.make_ready(c);
        }
        // Three equal-priority threads are picked in FIFO order.
        assert_eq!(sched.pick_next(), a);
        assert_eq!(sched.pick_next(), b);
        assert_eq!(sched.pick_next(), c);
    }

    #[test]
    fn tick_exhaustion_requeues_and_picks_next() {
        let (mut sched, idle) = make_scheduler(0);
        let a = make_tcb(1, "a", 3);
        let b = make_tcb(2, "b", 3);
        // SAFETY: freshly built, unlinked TCBs.
        unsafe {
            sched.make_ready(a);
            sched.make_ready(b);
        }
        // SAFETY: idle is the scheduler's current thread.
        let first = unsafe { sched.tick() };
        assert!(first.is_none(), "idle's slice reset silently, no switch");
        assert_eq!(sched.current(), idle);

        // Manually promote `a` to current to exercise slice exhaustion (the
        // production path reaches this only via a real context switch).
        sched.current = a;
        let slice = unsafe { (*a).time_slice };
        let mut switched = None;
        for _ in 0..slice {
            // SAFETY: `a` is a valid, live current thread.
            switched = unsafe { sched.tick() };
        }
        let (old, new) = switched.expect("slice must have expired");
        assert_eq!(old, a);
        assert_eq!(new, b);
    }

    #[test]
    fn adaptive_demotion_after_eight_full_slices() {
        let (mut sched, _idle) = make_scheduler(0);
        let a = make_tcb(1, "a", 3);
        sched.current = a;
        for _ in 0..8 {
            let slice = unsafe { (*a).time_slice_length };
            for _ in 0..slice {
                // SAFETY: `a` is the scheduler's current thread throughout.
                let switched = unsafe { sched.tick() };
                if let Some((_, next)) = switched {
                    sched.current = a;
                    let _ = next;
                }
            }
        }
        // SAFETY: `a` is still a live TCB.
        assert_eq!(unsafe { (*a).priority }, 4);
    }

    #[test]
    fn yield_immediately_returns_to_base_priority() {
        let (mut sched, _idle) = make_scheduler(0);
        let a = make_tcb(1, "a", 3);
        // SAFETY: `a` is a freshly built, valid TCB.
        unsafe { (*a).priority = 5 };
        sched.current = a;
        // Two priority levels above base recover one step per 8 yields, the
        // same period the demotion side adjusts on; 16 yields covers both
        // steps back to base.
        for _ in 0..16 {
            // SAFETY: `a` is the scheduler's current thread throughout.
            let (_old, _new) = unsafe { sched.do_yield() };
            sched.current = a;
        }
        // SAFETY: `a` is still a live TCB.
        assert_eq!(unsafe { (*a).priority }, 3);
    }

    #[test]
    fn sleep_wakes_in_wake_time_order() {
        let (mut sched, idle) = make_scheduler(0);
        let x = make_tcb(1, "x", 3);
        let y = make_tcb(2, "y", 3);
        sched.current = x;
        // SAFETY: `x` is the scheduler's current thread.
        unsafe { sched.do_sleep(50) };
        sched.current = y;
        // SAFETY: `y` is the scheduler's current thread.
        unsafe { sched.do_sleep(30) };

        sched.current = idle;
        sched.ticks = 30;
        // SAFETY: `idle` is the scheduler's current thread.
        unsafe { sched.tick() };
        assert_eq!(sched.pick_next(), y, "y (wake_time 30) must wake first");

        sched.ticks = 50;
        // SAFETY: `idle` is still the scheduler's current thread.
        sched.current = idle;
        unsafe { sched.tick() };
        assert_eq!(sched.pick_next(), x, "x (wake_time 50) wakes second");
    }

    #[test]
    fn block_and_unblock_round_trip() {
        let (mut sched, idle) = make_scheduler(0);
        let a = make_tcb(1, "a", 3);
        sched.current = a;
        // SAFETY: `a` is the scheduler's current thread.
        let (old, new) = unsafe { sched.do_block() };
        assert_eq!(old, a);
        assert_eq!(new, idle);
        // SAFETY: `a` is still a live TCB, currently in the blocked queue.
        assert_eq!(unsafe { (*a).state }, ThreadState::Blocked);

        // SAFETY: `a` is currently linked into the blocked queue.
        unsafe { sched.unblock(a) };
        assert_eq!(sched.pick_next(), a);
    }
}
