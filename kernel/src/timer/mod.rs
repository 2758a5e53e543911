//! Timer subsystem.
//!
//! A monotonic microsecond clock (`system_time`) fed by the TSC when it
//! calibrates, or by tick counting otherwise, drives per-CPU queues of
//! pending timers ordered by deadline. The hardware side is a pluggable
//! [`TimerDevice`]: the per-CPU LAPIC timer in one-shot mode when available,
//! the PIT as a periodic fallback.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    config::MAX_CPUS,
    sync::{waitqueue::WaitEntry, OnceLock, SpinLock, WaitStatus},
};

/// Fallback tick period (PIT at 1 kHz) and the ceiling between one-shot
/// reprograms, so preemption keeps its granularity even with no timers due.
pub const TICK_PERIOD_US: u64 = 1_000;

/// Firing mode a hardware timer device supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fixed-rate tick; `prepare` is a no-op.
    Periodic,
    /// The next firing is programmed explicitly via `prepare`.
    OneShot,
}

/// Contract a hardware timer device provides to the core.
pub trait TimerDevice: Send + Sync {
    fn name(&self) -> &'static str;
    fn mode(&self) -> TimerMode;
    fn enable(&self);
    fn disable(&self);
    /// For one-shot devices: fire the tick interrupt in `usecs`.
    fn prepare(&self, usecs: u64);
}

/// Handle for cancelling a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    cpu: usize,
    key: (u64, u64),
}

/// Timer handlers return whether the scheduler should preempt.
pub type TimerCallback = fn(usize) -> bool;

enum TimerAction {
    /// Claim the wait entry with `TimedOut` and ready its thread.
    Wakeup(Arc<WaitEntry>),
    /// Run a callback; reschedule when it returns true.
    Callback(TimerCallback, usize),
}

struct PendingTimer {
    action: TimerAction,
    /// Reload interval for periodic timers.
    period_us: Option<u64>,
}

struct CpuTimers {
    /// Pending timers ordered by (deadline, sequence).
    queue: BTreeMap<(u64, u64), PendingTimer>,
    last_tick_us: u64,
}

impl CpuTimers {
    const fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            last_tick_us: 0,
        }
    }
}

static TIMERS: [SpinLock<CpuTimers>; MAX_CPUS] =
    [const { SpinLock::new(CpuTimers::new()) }; MAX_CPUS];
static SEQUENCE: AtomicU64 = AtomicU64::new(0);
static DEVICE: OnceLock<Box<dyn TimerDevice>> = OnceLock::new();

// ---------------------------------------------------------------------------
// Monotonic clock
// ---------------------------------------------------------------------------

/// Tick-counted fallback clock, advanced by the boot CPU.
static TICK_CLOCK_US: AtomicU64 = AtomicU64::new(0);

/// Last value `system_time` returned; the max-clamp keeps the clock
/// monotonic across CPUs within the calibration skew bound.
static LAST_TIME_US: AtomicU64 = AtomicU64::new(0);

#[cfg(not(target_os = "none"))]
static MOCK_TIME_US: AtomicU64 = AtomicU64::new(0);

/// Monotonic microseconds since boot.
pub fn system_time() -> u64 {
    #[cfg(not(target_os = "none"))]
    let raw = MOCK_TIME_US.load(Ordering::Acquire);
    #[cfg(target_os = "none")]
    let raw = {
        let tsc = crate::arch::timer::tsc_time_us();
        if tsc != 0 {
            tsc
        } else {
            TICK_CLOCK_US.load(Ordering::Acquire)
        }
    };
    LAST_TIME_US.fetch_max(raw, Ordering::AcqRel).max(raw)
}

/// Advance the mock clock. Host test harness only; the bare-metal clock is
/// driven by hardware.
#[cfg(not(target_os = "none"))]
pub fn advance_mock_time(us: u64) {
    MOCK_TIME_US.fetch_add(us, Ordering::Release);
}

// ---------------------------------------------------------------------------
// Arming and cancelling
// ---------------------------------------------------------------------------

fn insert(cpu: usize, delay_us: u64, timer: PendingTimer) -> TimerHandle {
    let deadline = system_time() + delay_us.max(1);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let key = (deadline, seq);
    TIMERS[cpu].lock().queue.insert(key, timer);
    reprogram(cpu);
    TimerHandle { cpu, key }
}

/// Arm a one-shot wakeup for a sleeping thread's wait entry.
pub fn arm_wakeup(delay_us: u64, entry: Arc<WaitEntry>) -> TimerHandle {
    insert(
        crate::arch::cpu_id(),
        delay_us,
        PendingTimer {
            action: TimerAction::Wakeup(entry),
            period_us: None,
        },
    )
}

/// Arm a callback timer, periodic when `period_us` is set.
pub fn arm_callback(
    delay_us: u64,
    period_us: Option<u64>,
    callback: TimerCallback,
    data: usize,
) -> TimerHandle {
    insert(
        crate::arch::cpu_id(),
        delay_us,
        PendingTimer {
            action: TimerAction::Callback(callback, data),
            period_us,
        },
    )
}

/// Cancel a pending timer. Harmless when it already fired.
pub fn cancel(handle: TimerHandle) {
    TIMERS[handle.cpu].lock().queue.remove(&handle.key);
}

/// Program a one-shot device for the earliest pending deadline, capped at
/// the tick period so preemption never stalls.
fn reprogram(cpu: usize) {
    let Some(device) = DEVICE.get() else { return };
    if device.mode() != TimerMode::OneShot || cpu != crate::arch::cpu_id() {
        return;
    }
    let now = system_time();
    let next = TIMERS[cpu]
        .lock()
        .queue
        .keys()
        .next()
        .map(|(deadline, _)| deadline.saturating_sub(now))
        .unwrap_or(TICK_PERIOD_US);
    device.prepare(next.clamp(1, TICK_PERIOD_US));
}

// ---------------------------------------------------------------------------
// Tick processing
// ---------------------------------------------------------------------------

/// Service the timer interrupt on this CPU: advance the clock, fire due
/// timers, and report whether a reschedule is needed (a handler asked for
/// one, or the running thread's timeslice expired).
pub fn tick() -> bool {
    let cpu = crate::arch::cpu_id();
    if cpu == 0 {
        TICK_CLOCK_US.fetch_add(TICK_PERIOD_US, Ordering::Release);
    }
    let now = system_time();

    let (due, elapsed) = {
        let mut timers = TIMERS[cpu].lock();
        let elapsed = now.saturating_sub(timers.last_tick_us).max(1);
        timers.last_tick_us = now;

        let mut due = alloc::vec::Vec::new();
        loop {
            let Some((&key, _)) = timers.queue.iter().next() else {
                break;
            };
            if key.0 > now {
                break;
            }
            let timer = timers.queue.remove(&key).expect("due timer vanished");
            due.push(timer);
        }
        (due, elapsed)
    };

    let mut preempt = false;
    for timer in due {
        match timer.action {
            TimerAction::Wakeup(entry) => {
                if entry.claim(WaitStatus::TimedOut) {
                    crate::sched::ready(entry.thread().clone());
                    preempt = true;
                }
            }
            TimerAction::Callback(callback, data) => {
                if callback(data) {
                    preempt = true;
                }
                if let Some(period) = timer.period_us {
                    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
                    TIMERS[cpu].lock().queue.insert(
                        (now + period, seq),
                        PendingTimer {
                            action: TimerAction::Callback(callback, data),
                            period_us: Some(period),
                        },
                    );
                }
            }
        }
    }

    reprogram(cpu);
    preempt | crate::sched::tick(elapsed)
}

/// Number of timers pending on this CPU.
pub fn pending_count() -> usize {
    TIMERS[crate::arch::cpu_id()].lock().queue.len()
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Calibrate the time source and start the tick device: the per-CPU LAPIC
/// timer when calibration succeeded, the PIT otherwise.
pub fn init() {
    #[cfg(target_os = "none")]
    {
        crate::arch::timer::calibrate();
        let device: Box<dyn TimerDevice> = if crate::arch::timer::LapicTimer::available() {
            Box::new(crate::arch::timer::LapicTimer::new())
        } else {
            Box::new(crate::arch::timer::Pit::new(1_000))
        };
        device.enable();
        if device.mode() == TimerMode::OneShot {
            device.prepare(TICK_PERIOD_US);
        }
        log::info!("timer online: {} ({:?})", device.name(), device.mode());
        DEVICE
            .set(device)
            .unwrap_or_else(|_| panic!("timer initialized twice"));
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = system_time();
        advance_mock_time(100);
        let b = system_time();
        assert!(b >= a + 100);
        let c = system_time();
        assert!(c >= b);
    }

    #[test]
    fn timers_order_by_deadline_then_sequence() {
        let now = system_time();
        let mut timers = CpuTimers::new();
        fn cb(_: usize) -> bool {
            false
        }
        timers.queue.insert(
            (now + 500, 1),
            PendingTimer {
                action: TimerAction::Callback(cb, 0),
                period_us: None,
            },
        );
        timers.queue.insert(
            (now + 100, 2),
            PendingTimer {
                action: TimerAction::Callback(cb, 1),
                period_us: None,
            },
        );
        let first = timers.queue.keys().next().copied().expect("head");
        assert_eq!(first.0, now + 100);
    }

    /// Cancel and expiry share the per-CPU queue, so they run as one
    /// sequential case.
    #[test]
    fn pending_timers_cancel_and_expire() {
        fn cb(_: usize) -> bool {
            false
        }
        let before = pending_count();
        let handle = arm_callback(1_000_000_000, None, cb, 0);
        assert_eq!(pending_count(), before + 1);
        cancel(handle);
        assert_eq!(pending_count(), before);
        // Cancelling again is harmless.
        cancel(handle);

        let entry = WaitEntry::new(crate::sched::current_thread());
        let _handle = arm_wakeup(10, entry.clone());
        advance_mock_time(10_000);
        // Drive the tick path by hand; the entry must come due and claim.
        let _ = tick();
        assert!(!entry.is_pending());
        assert_eq!(entry.status(), WaitStatus::TimedOut);
    }
}
