//! Wait queues and the wait-entry wake protocol.
//!
//! A blocking thread allocates a [`WaitEntry`] shared between itself and the
//! queue it sleeps on. Exactly one party claims the entry: a waker (Woken or
//! Disturbed), the timeout timer (TimedOut), or a kill (Interrupted). Losing
//! claimants leave the entry where it is; queues skip dead entries lazily,
//! so no raw back-pointers into queues are ever needed.

use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicU8, Ordering};

use crate::{
    sched::{self, thread::Thread},
    sync::{SpinLock, Timeout},
};

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// A waker handed the sleeper whatever it was waiting for.
    Woken,
    /// The deadline passed first.
    TimedOut,
    /// A kill or signal cancelled the wait.
    Interrupted,
    /// A broadcast woke the sleeper without satisfying its condition; the
    /// caller must re-examine shared state (used for hangup and shutdown).
    Disturbed,
}

const PENDING: u8 = 0;
const WOKEN: u8 = 1;
const TIMED_OUT: u8 = 2;
const INTERRUPTED: u8 = 3;
const DISTURBED: u8 = 4;

/// Shared record of one thread's wait on one queue.
pub struct WaitEntry {
    thread: Arc<Thread>,
    state: AtomicU8,
}

impl WaitEntry {
    pub fn new(thread: Arc<Thread>) -> Arc<Self> {
        Arc::new(Self {
            thread,
            state: AtomicU8::new(PENDING),
        })
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// Try to settle the entry with `status`. The single successful claimant
    /// is responsible for readying the thread.
    pub fn claim(&self, status: WaitStatus) -> bool {
        let value = match status {
            WaitStatus::Woken => WOKEN,
            WaitStatus::TimedOut => TIMED_OUT,
            WaitStatus::Interrupted => INTERRUPTED,
            WaitStatus::Disturbed => DISTURBED,
        };
        self.state
            .compare_exchange(PENDING, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Final status. Only meaningful once the sleeper has been rescheduled.
    pub fn status(&self) -> WaitStatus {
        match self.state.load(Ordering::Acquire) {
            WOKEN => WaitStatus::Woken,
            TIMED_OUT => WaitStatus::TimedOut,
            INTERRUPTED => WaitStatus::Interrupted,
            DISTURBED => WaitStatus::Disturbed,
            _ => WaitStatus::Woken,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }
}

/// FIFO of blocked threads guarded by its own spinlock.
pub struct WaitQueue {
    name: &'static str,
    waiters: SpinLock<VecDeque<Arc<WaitEntry>>>,
}

impl WaitQueue {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Sleep until `wake_one`/`wake_all` picks this thread, the timeout
    /// elapses, or (when `interruptible`) a kill lands.
    ///
    /// `condition` is re-evaluated under the queue lock immediately before
    /// committing to sleep; returning `false` aborts with `Woken`. This
    /// closes the race between a caller's unlocked test and enqueueing.
    pub fn sleep_if<F: FnOnce() -> bool>(
        &self,
        condition: F,
        timeout: Timeout,
        interruptible: bool,
    ) -> WaitStatus {
        let entry = {
            let mut waiters = self.waiters.lock();
            if !condition() {
                return WaitStatus::Woken;
            }
            let entry = WaitEntry::new(sched::current_thread());
            waiters.push_back(entry.clone());
            entry
        };
        sched::block_current(&entry, timeout, interruptible, self.name)
    }

    /// Queue an already-built entry. The caller commits the sleep itself
    /// with [`sched::block_current`] after dropping its own lock; used by
    /// primitives that embed the pre-sleep test in their own state lock.
    pub fn enqueue(&self, entry: Arc<WaitEntry>) {
        self.waiters.lock().push_back(entry);
    }

    /// Wake the longest-waiting thread. Returns `false` when no pending
    /// waiter exists.
    pub fn wake_one(&self) -> bool {
        let mut waiters = self.waiters.lock();
        while let Some(entry) = waiters.pop_front() {
            if entry.claim(WaitStatus::Woken) {
                drop(waiters);
                sched::ready(entry.thread().clone());
                return true;
            }
        }
        false
    }

    /// Wake every pending waiter with `Disturbed`, forcing them to re-check
    /// shared state. Used for hangup and shutdown broadcasts.
    pub fn disturb_all(&self) -> usize {
        let drained: VecDeque<_> = {
            let mut waiters = self.waiters.lock();
            core::mem::take(&mut *waiters)
        };
        let mut woken = 0;
        for entry in drained {
            if entry.claim(WaitStatus::Disturbed) {
                sched::ready(entry.thread().clone());
                woken += 1;
            }
        }
        woken
    }

    /// Wake every pending waiter normally.
    pub fn wake_all(&self) -> usize {
        let drained: VecDeque<_> = {
            let mut waiters = self.waiters.lock();
            core::mem::take(&mut *waiters)
        };
        let mut woken = 0;
        for entry in drained {
            if entry.claim(WaitStatus::Woken) {
                sched::ready(entry.thread().clone());
                woken += 1;
            }
        }
        woken
    }

    /// Are any pending waiters queued?
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().iter().all(|e| !e.is_pending())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn entry_single_claim() {
        let entry = WaitEntry::new(sched::current_thread());
        assert!(entry.is_pending());
        assert!(entry.claim(WaitStatus::TimedOut));
        assert!(!entry.claim(WaitStatus::Woken));
        assert_eq!(entry.status(), WaitStatus::TimedOut);
    }

    #[test]
    fn wake_one_skips_settled_entries() {
        let queue = WaitQueue::new("test");
        let dead = WaitEntry::new(sched::current_thread());
        assert!(dead.claim(WaitStatus::TimedOut));
        queue.enqueue(dead);
        // The only queued entry is already settled, so nothing wakes.
        assert!(!queue.wake_one());
        assert!(queue.is_empty());
    }

    #[test]
    fn sleep_if_aborts_when_condition_fails() {
        let queue = WaitQueue::new("test");
        let status = queue.sleep_if(|| false, crate::sync::FOREVER, false);
        assert_eq!(status, WaitStatus::Woken);
        assert!(queue.is_empty());
    }
}
