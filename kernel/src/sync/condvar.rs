//! Condition variable over a sleeping [`Mutex`].
//!
//! The caller holds the mutex, checks its predicate, and `wait` atomically
//! releases the mutex and suspends on the embedded wait queue. `broadcast`
//! exists for shutdown-style events where every waiter must re-examine the
//! world.

use crate::{
    error::{KernelError, KernelResult},
    sched,
    sync::{waitqueue::WaitEntry, Mutex, Timeout, WaitQueue, WaitStatus},
};

pub struct CondVar {
    name: &'static str,
    waiters: WaitQueue,
}

impl CondVar {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: WaitQueue::new(name),
        }
    }

    /// Release `mutex`, sleep until notified (or the timeout/kill lands),
    /// then re-acquire `mutex` before returning. The caller must hold
    /// `mutex`; as with any condition variable, the predicate must be
    /// re-tested on return.
    pub fn wait(&self, mutex: &Mutex, timeout: Timeout, interruptible: bool) -> KernelResult<()> {
        assert!(
            mutex.held_by_current(),
            "condvar {} waited without holding {}",
            self.name,
            mutex.name()
        );
        // Enqueued before the unlock, so a notify between unlock and sleep
        // still finds (and claims) this entry.
        let entry = WaitEntry::new(sched::current_thread());
        self.waiters.enqueue(entry.clone());
        mutex.unlock();
        let status = sched::block_current(&entry, timeout, interruptible, self.name);
        mutex.lock();
        match status {
            WaitStatus::Woken | WaitStatus::Disturbed => Ok(()),
            WaitStatus::TimedOut => Err(KernelError::TimedOut),
            WaitStatus::Interrupted => Err(KernelError::Interrupted),
        }
    }

    /// Wake one waiter.
    pub fn notify_one(&self) -> bool {
        self.waiters.wake_one()
    }

    /// Wake every waiter.
    pub fn notify_all(&self) -> usize {
        self.waiters.wake_all()
    }

    /// Shutdown-style wakeup: every waiter returns and must re-check shared
    /// state.
    pub fn broadcast(&self) -> usize {
        self.waiters.disturb_all()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn notify_with_no_waiters_is_false() {
        let cv = CondVar::new("test");
        assert!(!cv.notify_one());
        assert_eq!(cv.notify_all(), 0);
        assert_eq!(cv.broadcast(), 0);
    }

    #[test]
    #[should_panic(expected = "without holding")]
    fn wait_without_mutex_panics() {
        let cv = CondVar::new("test");
        let m = Mutex::new("test");
        let _ = cv.wait(&m, crate::sync::FOREVER, false);
    }
}
