//! Interrupt-safe spinlock.
//!
//! `lock` disables local interrupts and remembers the prior state; `unlock`
//! (guard drop) restores it. Non-recursive: re-locking on the same CPU
//! deadlocks, which the lock ordering in the concurrency model exists to
//! prevent.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to the inner value.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
// SAFETY: as above; only one guard can exist at a time.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquire the lock, disabling local interrupts for the duration.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq_was_enabled = crate::arch::irq_disable();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin with interrupts restored so this CPU can still take the
            // tick that may unblock the holder.
            crate::arch::irq_restore(irq_was_enabled);
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            crate::arch::irq_disable();
        }
        SpinLockGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// Acquire the lock without blocking. Returns `None` when contended.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq_was_enabled = crate::arch::irq_disable();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                irq_was_enabled,
            })
        } else {
            crate::arch::irq_restore(irq_was_enabled);
            None
        }
    }

    /// Is the lock currently held?
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    irq_was_enabled: bool,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in deref.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        crate::arch::irq_restore(self.irq_was_enabled);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_serializes_access() {
        let lock = SpinLock::new(0u32);
        {
            let mut g = lock.lock();
            *g += 1;
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_succeeds_when_free() {
        let lock = SpinLock::new("free");
        let g = lock.try_lock().expect("uncontended try_lock");
        assert_eq!(*g, "free");
    }
}
