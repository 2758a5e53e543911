//! Sleeping mutex with ownership tracking.
//!
//! Contended lockers sleep in FIFO order and unlock hands the mutex to the
//! head waiter directly. Re-acquiring while owned panics unless the mutex
//! was created recursive; unlocking from a non-owner always panics. Both
//! are programmer-contract violations, not recoverable errors.

use alloc::{collections::VecDeque, sync::Arc};

use crate::{
    sched::{self, thread::ThreadId},
    sync::{waitqueue::WaitEntry, SpinLock, WaitStatus, FOREVER},
};

struct MutexInner {
    owner: Option<ThreadId>,
    recursion: u32,
    waiters: VecDeque<Arc<WaitEntry>>,
}

pub struct Mutex {
    name: &'static str,
    recursive: bool,
    inner: SpinLock<MutexInner>,
}

impl Mutex {
    pub const fn new(name: &'static str) -> Self {
        Self::with_recursion(name, false)
    }

    /// A mutex the owner may re-acquire; each `lock` then needs a matching
    /// `unlock`. The kernel address-space map is the one user.
    pub const fn recursive(name: &'static str) -> Self {
        Self::with_recursion(name, true)
    }

    const fn with_recursion(name: &'static str, recursive: bool) -> Self {
        Self {
            name,
            recursive,
            inner: SpinLock::new(MutexInner {
                owner: None,
                recursion: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the mutex, sleeping while another thread owns it.
    pub fn lock(&self) {
        let me = sched::current_thread();
        let entry = {
            let mut inner = self.inner.lock();
            match inner.owner {
                None => {
                    inner.owner = Some(me.id());
                    return;
                }
                Some(owner) if owner == me.id() => {
                    if self.recursive {
                        inner.recursion += 1;
                        return;
                    }
                    panic!("recursive lock of mutex {}", self.name);
                }
                Some(_) => {
                    let entry = WaitEntry::new(me.clone());
                    inner.waiters.push_back(entry.clone());
                    entry
                }
            }
        };
        // Ownership is transferred by the unlocker before it wakes us, so a
        // Woken status means the mutex is already ours.
        let status = sched::block_current(&entry, FOREVER, false, self.name);
        debug_assert_eq!(status, WaitStatus::Woken);
    }

    /// Acquire without sleeping. Recursion is honoured as in [`lock`].
    pub fn try_lock(&self) -> bool {
        let me = sched::current_thread();
        let mut inner = self.inner.lock();
        match inner.owner {
            None => {
                inner.owner = Some(me.id());
                true
            }
            Some(owner) if owner == me.id() && self.recursive => {
                inner.recursion += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release the mutex. Panics when the caller is not the owner.
    pub fn unlock(&self) {
        let me = sched::current_thread();
        let handoff = {
            let mut inner = self.inner.lock();
            assert_eq!(
                inner.owner,
                Some(me.id()),
                "unlock of mutex {} by non-owner",
                self.name
            );
            if inner.recursion > 0 {
                inner.recursion -= 1;
                return;
            }
            loop {
                match inner.waiters.pop_front() {
                    Some(entry) => {
                        if entry.claim(WaitStatus::Woken) {
                            inner.owner = Some(entry.thread().id());
                            break Some(entry);
                        }
                    }
                    None => {
                        inner.owner = None;
                        break None;
                    }
                }
            }
        };
        if let Some(entry) = handoff {
            sched::ready(entry.thread().clone());
        }
    }

    /// Is the mutex held by anyone?
    pub fn is_locked(&self) -> bool {
        self.inner.lock().owner.is_some()
    }

    /// Is the mutex held by the calling thread?
    pub fn held_by_current(&self) -> bool {
        self.inner.lock().owner == Some(sched::current_thread().id())
    }

    /// Run `f` with the mutex held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let result = f();
        self.unlock();
        result
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_round_trip() {
        let m = Mutex::new("test");
        assert!(!m.is_locked());
        m.lock();
        assert!(m.is_locked());
        assert!(m.held_by_current());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn recursive_mutex_counts_depth() {
        let m = Mutex::recursive("test");
        m.lock();
        m.lock();
        assert!(m.try_lock());
        m.unlock();
        m.unlock();
        assert!(m.is_locked());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    #[should_panic(expected = "recursive lock")]
    fn double_lock_of_plain_mutex_panics() {
        let m = Mutex::new("test");
        m.lock();
        m.lock();
    }

    #[test]
    #[should_panic(expected = "by non-owner")]
    fn unlock_unowned_panics() {
        let m = Mutex::new("test");
        m.unlock();
    }

    #[test]
    fn with_releases_on_exit() {
        let m = Mutex::new("test");
        let v = m.with(|| 7);
        assert_eq!(v, 7);
        assert!(!m.is_locked());
    }
}
