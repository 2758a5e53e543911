//! Writer-preferring sleeping read/write lock.
//!
//! Multiple readers or one writer. Once a writer queues, new readers queue
//! behind it, so writers cannot starve behind a stream of readers.

use alloc::{collections::VecDeque, sync::Arc};

use crate::{
    sched,
    sync::{waitqueue::WaitEntry, SpinLock, WaitStatus, FOREVER},
};

struct RwInner {
    readers: u32,
    writer: bool,
    read_waiters: VecDeque<Arc<WaitEntry>>,
    write_waiters: VecDeque<Arc<WaitEntry>>,
}

impl RwInner {
    fn writer_pending(&self) -> bool {
        self.write_waiters.iter().any(|e| e.is_pending())
    }
}

pub struct RwLock {
    name: &'static str,
    inner: SpinLock<RwInner>,
}

impl RwLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: SpinLock::new(RwInner {
                readers: 0,
                writer: false,
                read_waiters: VecDeque::new(),
                write_waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire for reading. Queues behind any waiting writer.
    pub fn read_lock(&self) {
        loop {
            let entry = {
                let mut inner = self.inner.lock();
                if !inner.writer && !inner.writer_pending() {
                    inner.readers += 1;
                    return;
                }
                let entry = WaitEntry::new(sched::current_thread());
                inner.read_waiters.push_back(entry.clone());
                entry
            };
            let status = sched::block_current(&entry, FOREVER, false, self.name);
            debug_assert_eq!(status, WaitStatus::Woken);
            // A waking writer bumped `readers` for each reader it admitted.
            if status == WaitStatus::Woken {
                return;
            }
        }
    }

    /// Try to acquire for reading without sleeping.
    pub fn try_read_lock(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.writer && !inner.writer_pending() {
            inner.readers += 1;
            true
        } else {
            false
        }
    }

    /// Release a read acquisition.
    pub fn read_unlock(&self) {
        let handoff = {
            let mut inner = self.inner.lock();
            assert!(inner.readers > 0, "read_unlock of unread {}", self.name);
            inner.readers -= 1;
            if inner.readers == 0 {
                Self::pop_writer(&mut inner)
            } else {
                None
            }
        };
        if let Some(entry) = handoff {
            sched::ready(entry.thread().clone());
        }
    }

    /// Acquire for writing, excluding readers and other writers.
    pub fn write_lock(&self) {
        let entry = {
            let mut inner = self.inner.lock();
            if !inner.writer && inner.readers == 0 {
                inner.writer = true;
                return;
            }
            let entry = WaitEntry::new(sched::current_thread());
            inner.write_waiters.push_back(entry.clone());
            entry
        };
        let status = sched::block_current(&entry, FOREVER, false, self.name);
        debug_assert_eq!(status, WaitStatus::Woken);
    }

    /// Try to acquire for writing without sleeping.
    pub fn try_write_lock(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.writer && inner.readers == 0 {
            inner.writer = true;
            true
        } else {
            false
        }
    }

    /// Release a write acquisition. The next writer is preferred; otherwise
    /// every queued reader is admitted at once.
    pub fn write_unlock(&self) {
        let mut to_ready = alloc::vec::Vec::new();
        {
            let mut inner = self.inner.lock();
            assert!(inner.writer, "write_unlock of unwritten {}", self.name);
            inner.writer = false;
            if let Some(entry) = Self::pop_writer(&mut inner) {
                to_ready.push(entry);
            } else {
                while let Some(entry) = inner.read_waiters.pop_front() {
                    if entry.claim(WaitStatus::Woken) {
                        inner.readers += 1;
                        to_ready.push(entry);
                    }
                }
            }
        }
        for entry in to_ready {
            sched::ready(entry.thread().clone());
        }
    }

    /// Pop the next pending writer, marking the lock write-held for it.
    fn pop_writer(inner: &mut RwInner) -> Option<Arc<WaitEntry>> {
        while let Some(entry) = inner.write_waiters.pop_front() {
            if entry.claim(WaitStatus::Woken) {
                inner.writer = true;
                return Some(entry);
            }
        }
        None
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let l = RwLock::new("test");
        l.read_lock();
        assert!(l.try_read_lock());
        assert!(!l.try_write_lock());
        l.read_unlock();
        l.read_unlock();

        l.write_lock();
        assert!(!l.try_read_lock());
        assert!(!l.try_write_lock());
        l.write_unlock();
        assert!(l.try_read_lock());
        l.read_unlock();
    }

    #[test]
    #[should_panic(expected = "read_unlock of unread")]
    fn unbalanced_read_unlock_panics() {
        let l = RwLock::new("test");
        l.read_unlock();
    }
}
