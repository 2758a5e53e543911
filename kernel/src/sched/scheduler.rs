//! Per-CPU scheduler.
//!
//! Each CPU owns a multilevel run queue: one FIFO per priority level, level
//! 0 highest. Schedule-in picks the highest non-empty level; timeslices are
//! a function of priority and expire on timer ticks. What happens to the
//! outgoing thread is decided *after* the context switch, on the incoming
//! thread's stack, so a thread is never visible as sleeping or dead while
//! its registers are still live.

use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    config::{MAX_CPUS, PRIORITY_IDLE, PRIORITY_LEVELS},
    sync::{waitqueue::WaitEntry, SpinLock, Timeout, WaitStatus},
};

use super::thread::{self, Thread, ThreadState};

struct RunQueues {
    levels: [VecDeque<Arc<Thread>>; PRIORITY_LEVELS],
    /// Bit N set when level N is non-empty.
    occupied: u32,
}

impl RunQueues {
    const fn new() -> Self {
        Self {
            levels: [const { VecDeque::new() }; PRIORITY_LEVELS],
            occupied: 0,
        }
    }

    fn push(&mut self, thread: Arc<Thread>) {
        let level = thread.priority() as usize;
        self.levels[level].push_back(thread);
        self.occupied |= 1 << level;
    }

    fn pop_highest(&mut self) -> Option<Arc<Thread>> {
        if self.occupied == 0 {
            return None;
        }
        let level = self.occupied.trailing_zeros() as usize;
        let thread = self.levels[level].pop_front();
        if self.levels[level].is_empty() {
            self.occupied &= !(1 << level);
        }
        thread
    }

    /// Best non-empty level, if any.
    fn highest_level(&self) -> Option<usize> {
        if self.occupied == 0 {
            None
        } else {
            Some(self.occupied.trailing_zeros() as usize)
        }
    }

    fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }
}

struct CpuData {
    queues: SpinLock<RunQueues>,
    current: SpinLock<Option<Arc<Thread>>>,
    /// Outgoing thread, handed across the context switch to finish_switch.
    previous: SpinLock<Option<Arc<Thread>>>,
    idle: SpinLock<Option<Arc<Thread>>>,
    need_resched: AtomicBool,
}

impl CpuData {
    const fn new() -> Self {
        Self {
            queues: SpinLock::new(RunQueues::new()),
            current: SpinLock::new(None),
            previous: SpinLock::new(None),
            idle: SpinLock::new(None),
            need_resched: AtomicBool::new(false),
        }
    }
}

static CPUS: [CpuData; MAX_CPUS] = [const { CpuData::new() }; MAX_CPUS];

fn this_cpu() -> &'static CpuData {
    &CPUS[crate::arch::cpu_id()]
}

// ---------------------------------------------------------------------------
// Current thread
// ---------------------------------------------------------------------------

/// The thread executing on this CPU. Always valid once the boot path has
/// called [`adopt_boot_thread`]; on the host test harness a detached thread
/// stands in.
pub fn current_thread() -> Arc<Thread> {
    #[cfg(not(target_os = "none"))]
    {
        lazy_static::lazy_static! {
            static ref HOST_THREAD: Arc<Thread> = thread::bootstrap("host", 0);
        }
        return HOST_THREAD.clone();
    }
    #[cfg(target_os = "none")]
    {
        this_cpu()
            .current
            .lock()
            .clone()
            .expect("scheduler used before adopt_boot_thread")
    }
}

/// Wrap the executing boot flow of `cpu` as a thread and make it current.
/// Must run before anything can block on this CPU.
pub fn adopt_boot_thread(name: &str) {
    let cpu = crate::arch::cpu_id();
    let boot = thread::bootstrap(name, cpu);
    *CPUS[cpu].current.lock() = Some(boot);
}

/// Install the idle thread for this CPU. It is dispatched from its own slot
/// whenever the run queues are empty and a thread must block.
pub fn set_idle_thread(idle: Arc<Thread>) {
    idle.set_priority_raw(PRIORITY_IDLE);
    idle.set_state(ThreadState::Ready);
    *this_cpu().idle.lock() = Some(idle);
}

// ---------------------------------------------------------------------------
// Ready / wake
// ---------------------------------------------------------------------------

/// Place `thread` on a run queue. Used both to start a CREATED thread (via
/// [`run`]) and to wake a sleeper whose wait entry was claimed.
pub fn ready(thread: Arc<Thread>) {
    // The host harness has no run queues; record the state and stop.
    #[cfg(not(target_os = "none"))]
    thread.set_state(ThreadState::Ready);

    #[cfg(target_os = "none")]
    {
        // Wait until the thread's register state is off its old CPU before
        // touching its state: enqueueing earlier could get it run on two
        // CPUs, and flipping the state earlier would race finish_switch's
        // decision about the outgoing thread.
        while thread.on_cpu() {
            core::hint::spin_loop();
        }
        thread.set_state(ThreadState::Ready);
        let target = thread.cpu();
        let target = if target < crate::arch::cpu_count() {
            target
        } else {
            crate::arch::cpu_id()
        };
        CPUS[target].queues.lock().push(thread);
        CPUS[target].need_resched.store(true, Ordering::Release);
        if target != crate::arch::cpu_id() {
            crate::arch::send_reschedule_ipi(target);
        }
    }
}

/// Transition a CREATED thread to READY on the chosen CPU (the current one
/// by default).
pub fn run(thread: &Arc<Thread>, cpu: Option<usize>) {
    assert_eq!(
        thread.state(),
        ThreadState::Created,
        "run() on a thread that already ran"
    );
    if let Some(cpu) = cpu {
        thread.set_cpu(cpu % crate::arch::cpu_count());
    } else {
        thread.set_cpu(crate::arch::cpu_id());
    }
    thread.reset_timeslice();
    ready(thread.clone());
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

/// Commit the calling thread to the wait described by `entry`.
///
/// The caller has already linked `entry` into a wait queue and dropped the
/// queue's lock. `timeout` follows the kernel convention (microseconds;
/// negative = forever; zero is the caller's job to reject). Returns once a
/// waker, the timeout, or a kill has claimed the entry.
pub fn block_current(
    entry: &Arc<WaitEntry>,
    timeout: Timeout,
    interruptible: bool,
    _waiting_on: &'static str,
) -> WaitStatus {
    debug_assert!(timeout != 0, "zero timeout must be handled by the caller");
    let thread = entry.thread().clone();

    // Interrupts stay off from here until the switch is complete, so the
    // timeout timer (local CPU) cannot fire while we are half-asleep.
    let irq = crate::arch::irq_disable();

    if interruptible {
        thread.set_wait_entry(Some(entry.clone()));
        // A kill that landed before we published the entry: claim it
        // ourselves and do not sleep.
        if thread.killed() && entry.claim(WaitStatus::Interrupted) {
            thread.set_wait_entry(None);
            crate::arch::irq_restore(irq);
            return WaitStatus::Interrupted;
        }
    }

    let timer = if timeout > 0 {
        Some(crate::timer::arm_wakeup(timeout as u64, entry.clone()))
    } else {
        None
    };

    thread.set_state(ThreadState::Sleeping);
    schedule();

    // Back on this thread's stack: the entry has been claimed.
    if let Some(timer) = timer {
        crate::timer::cancel(timer);
    }
    if interruptible {
        thread.set_wait_entry(None);
    }
    crate::arch::irq_restore(irq);
    entry.status()
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Pick and switch to the next runnable thread on this CPU. The outgoing
/// thread's fate (requeue, sleep, reaper) is settled by `finish_switch` on
/// the incoming side.
pub fn schedule() {
    #[cfg(not(target_os = "none"))]
    panic!("schedule() is not available on the host test harness");

    #[cfg(target_os = "none")]
    {
        let irq = crate::arch::irq_disable();
        let cpu = this_cpu();
        cpu.need_resched.store(false, Ordering::Relaxed);

        let current = cpu
            .current
            .lock()
            .clone()
            .expect("schedule before adopt_boot_thread");

        // A runnable current thread only gives way to an equal or better
        // level: a timeslice expiry round-robins within the level, but a
        // lower-priority thread never preempts.
        let next = {
            let mut queues = cpu.queues.lock();
            match queues.highest_level() {
                Some(level)
                    if current.state() != ThreadState::Running
                        || level <= current.priority() as usize =>
                {
                    queues.pop_highest()
                }
                _ => None,
            }
        };
        let next = match next {
            Some(next) => next,
            None => {
                if current.state() == ThreadState::Running {
                    // Nothing better to run; keep going on a fresh slice.
                    if current.timeslice_us() == 0 {
                        current.reset_timeslice();
                    }
                    crate::arch::irq_restore(irq);
                    return;
                }
                cpu.idle
                    .lock()
                    .clone()
                    .expect("blocking before the idle thread exists")
            }
        };

        if Arc::ptr_eq(&next, &current) {
            next.set_state(ThreadState::Running);
            crate::arch::irq_restore(irq);
            return;
        }

        next.set_state(ThreadState::Running);
        next.set_cpu(crate::arch::cpu_id());
        next.set_on_cpu(true);
        next.reset_timeslice();
        *cpu.current.lock() = Some(next.clone());
        *cpu.previous.lock() = Some(current.clone());

        if let Some(process) = next.process() {
            process.address_space().switch_to();
        }

        // SAFETY: interrupts are disabled; both context cells belong to the
        // two threads this CPU is switching between.
        unsafe {
            crate::arch::context::switch(current.context_ptr(), next.context_ptr());
        }

        // Resumed at some later point: settle whoever ran before us.
        finish_switch();
        crate::arch::irq_restore(irq);
    }
}

/// Post-switch housekeeping, run on the incoming thread's stack: the
/// outgoing thread's registers are saved, so it may now be requeued, left
/// to its wait queue, or handed to the reaper.
pub fn finish_switch() {
    let prev = this_cpu().previous.lock().take();
    if let Some(prev) = prev {
        let state = prev.state();
        prev.set_on_cpu(false);
        match state {
            ThreadState::Running | ThreadState::Ready => {
                prev.set_state(ThreadState::Ready);
                this_cpu().queues.lock().push(prev);
            }
            ThreadState::Sleeping => {
                // The wait entry owns the thread now; a waker requeues it.
            }
            ThreadState::Dead => thread::reaper_enqueue(prev),
            ThreadState::Created => unreachable!("CREATED thread was running"),
        }
    }
}

/// Voluntarily give up the CPU, staying runnable.
pub fn yield_now() {
    #[cfg(target_os = "none")]
    schedule();
}

/// Sleep for at least `us` microseconds. Implemented as an anonymous timed
/// wait: nothing ever wakes the entry, so the timeout claims it.
pub fn sleep_us(us: u64) {
    if us == 0 {
        yield_now();
        return;
    }
    let entry = WaitEntry::new(current_thread());
    let _ = block_current(&entry, us as Timeout, false, "sleep");
}

/// Called at the tail of the timer interrupt when a reschedule is wanted.
/// Honours the preempt-disable counter.
pub fn preempt() {
    let thread = current_thread();
    if thread.preempt_count() > 0 {
        thread.note_missed_preempt();
        return;
    }
    schedule();
}

/// Enter a non-preemptible section.
pub fn preempt_disable() {
    current_thread().preempt_disable();
}

/// Leave a non-preemptible section; runs the reschedule the section
/// suppressed, if any.
pub fn preempt_enable() {
    if current_thread().preempt_enable() {
        schedule();
    }
}

/// Timer-tick hook: account the tick against the running thread and report
/// whether its timeslice is exhausted.
pub fn tick(elapsed_us: u64) -> bool {
    let thread = current_thread();
    thread.account_kernel_time(elapsed_us);
    if thread.state() != ThreadState::Running {
        return false;
    }
    thread.consume_timeslice(elapsed_us)
}

/// Threads queued on this CPU (diagnostics).
pub fn runnable_count() -> usize {
    this_cpu().queues.lock().len()
}

// ---------------------------------------------------------------------------
// Idle
// ---------------------------------------------------------------------------

/// Idle loop body for per-CPU idle threads.
pub fn idle_main(_arg: usize) {
    loop {
        crate::arch::idle_wait();
        #[cfg(target_os = "none")]
        if this_cpu().need_resched.load(Ordering::Acquire) {
            schedule();
        }
    }
}

/// Turn the calling (boot) thread into an idle thread. The boot flow calls
/// this once initialization finishes so it stops competing with real work
/// at kernel priority.
pub fn become_idle() -> ! {
    current_thread().set_priority_raw(PRIORITY_IDLE);
    idle_main(0);
    unreachable!("idle loop returned")
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn noop(_: usize) {}

    #[test]
    fn run_queue_orders_by_level_then_fifo() {
        let mut q = RunQueues::new();
        let high = thread::spawn("high", 4, true, noop, 0).expect("spawn");
        let mid_a = thread::spawn("mid-a", 16, true, noop, 0).expect("spawn");
        let mid_b = thread::spawn("mid-b", 16, true, noop, 0).expect("spawn");
        q.push(mid_a.clone());
        q.push(high.clone());
        q.push(mid_b.clone());
        assert_eq!(q.len(), 3);

        let first = q.pop_highest().expect("highest");
        assert_eq!(first.id(), high.id());
        let second = q.pop_highest().expect("fifo head");
        assert_eq!(second.id(), mid_a.id());
        let third = q.pop_highest().expect("fifo tail");
        assert_eq!(third.id(), mid_b.id());
        assert!(q.pop_highest().is_none());
    }

    #[test]
    fn timeslice_scales_with_priority() {
        let fast = thread::spawn("fast", 1, true, noop, 0).expect("spawn");
        let slow = thread::spawn("slow", 30, true, noop, 0).expect("spawn");
        fast.reset_timeslice();
        slow.reset_timeslice();
        assert!(fast.timeslice_us() > slow.timeslice_us());
    }

    #[test]
    fn tick_consumes_current_timeslice() {
        let thread = current_thread();
        thread.set_state(ThreadState::Running);
        thread.reset_timeslice();
        assert!(thread.timeslice_us() > 0);
        // Burning the whole remaining slice must request a reschedule.
        assert!(tick(thread.timeslice_us().max(1)));
    }
}
