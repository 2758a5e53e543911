//! Write-once cell for global singletons built during kmain.
//!
//! The kernel's process-wide singletons (kernel address space, scheduler
//! state, port registry) are created once before any secondary thread runs
//! and never torn down; this cell gives them safe, lock-free reads after
//! that point.

use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// The value, if initialization has happened.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was published by `set` via
            // Box::into_raw with Release ordering and is never freed.
            Some(unsafe { &*ptr })
        }
    }

    /// The value; panics before initialization. For singletons whose init
    /// order is fixed by kmain, a miss is a boot-sequence bug.
    pub fn expect(&self, what: &'static str) -> &'static T {
        match self.get() {
            Some(v) => v,
            None => panic!("{} used before initialization", what),
        }
    }

    /// Publish the value. Returns it back when already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = Box::into_raw(Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `ptr` came from Box::into_raw above and was never
                // published, so reclaiming it here is the only reference.
                let boxed = unsafe { Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }

    /// The value, initializing it with `f` on first use.
    pub fn get_or_init<F: FnOnce() -> T>(&self, f: F) -> &'static T {
        if let Some(v) = self.get() {
            return v;
        }
        let _ = self.set(f());
        self.get().expect("OnceLock empty after set")
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the value is heap-allocated and published through an AtomicPtr
// with Release/Acquire ordering; ownership transfer is sound when T: Send.
unsafe impl<T: Send> Send for OnceLock<T> {}
// SAFETY: concurrent `get` hands out shared references only, so T must be
// Sync; the CAS in `set` guarantees a single successful initializer.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn set_once_then_get() {
        let cell = OnceLock::new();
        assert!(cell.get().is_none());
        assert!(cell.set(41).is_ok());
        assert_eq!(cell.set(42), Err(42));
        assert_eq!(*cell.expect("cell"), 41);
    }

    #[test]
    fn get_or_init_runs_once() {
        let cell = OnceLock::new();
        assert_eq!(*cell.get_or_init(|| 7), 7);
        assert_eq!(*cell.get_or_init(|| 8), 7);
    }
}
