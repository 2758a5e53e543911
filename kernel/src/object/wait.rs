//! Waiting on object events, including multi-object waits.
//!
//! A [`Waiter`] is the rendezvous for one `object_wait` call: objects that
//! fire (or are already satisfied) signal it, and the caller blocks on its
//! counting semaphore. A [`Notifier`] is the object-side registry of
//! outstanding registrations for one event source.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    sync::{Semaphore, SpinLock, Timeout},
};

use super::{Handle, WaitEvent};

/// Caller-side state of one (possibly multi-object) wait.
pub struct Waiter {
    sem: Semaphore,
    /// Index of the first descriptor that signalled.
    first: SpinLock<Option<usize>>,
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sem: Semaphore::new("object-wait", 0),
            first: SpinLock::new(None),
        })
    }

    /// Signal that the descriptor at `index` is satisfied.
    pub fn signal(&self, index: usize) {
        {
            let mut first = self.first.lock();
            if first.is_none() {
                *first = Some(index);
            }
        }
        self.sem.up();
    }

    /// Block until a signal arrives. Interruptible; honours the kernel
    /// timeout convention.
    fn wait(&self, timeout: Timeout) -> KernelResult<usize> {
        if timeout == 0 && !self.sem.try_down() {
            return Err(KernelError::TimedOut);
        } else if timeout != 0 {
            self.sem.down(timeout, true)?;
        }
        Ok(self.first.lock().expect("signalled waiter with no index"))
    }
}

/// Object-side list of registered waiters for one event source.
pub struct Notifier {
    registrations: SpinLock<Vec<Registration>>,
}

struct Registration {
    waiter: Arc<Waiter>,
    index: usize,
    event: WaitEvent,
}

impl Notifier {
    pub const fn new() -> Self {
        Self {
            registrations: SpinLock::new(Vec::new()),
        }
    }

    /// Register `waiter`; it will be signalled on every [`notify`] of
    /// `event` until unregistered.
    pub fn register(&self, waiter: &Arc<Waiter>, index: usize, event: WaitEvent) {
        self.registrations.lock().push(Registration {
            waiter: waiter.clone(),
            index,
            event,
        });
    }

    /// Drop the registration matching (`waiter`, `index`, `event`).
    pub fn unregister(&self, waiter: &Arc<Waiter>, index: usize, event: WaitEvent) {
        self.registrations.lock().retain(|r| {
            !(Arc::ptr_eq(&r.waiter, waiter) && r.index == index && r.event == event)
        });
    }

    /// Signal every waiter registered for `event`. Returns how many were
    /// signalled.
    pub fn notify(&self, event: WaitEvent) -> usize {
        let to_signal: Vec<_> = {
            let registrations = self.registrations.lock();
            registrations
                .iter()
                .filter(|r| r.event == event)
                .map(|r| (r.waiter.clone(), r.index))
                .collect()
        };
        let count = to_signal.len();
        for (waiter, index) in to_signal {
            waiter.signal(index);
        }
        count
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for the first of several object events.
///
/// Registers with every `(handle, event)` pair, blocks on the shared
/// semaphore, then cancels all registrations. Returns the index of the
/// first descriptor that signalled. Interruptible; `timeout` follows the
/// kernel convention.
pub fn object_wait(descriptors: &[(Arc<Handle>, WaitEvent)], timeout: Timeout) -> KernelResult<usize> {
    if descriptors.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let waiter = Waiter::new();

    let mut registered = 0;
    let mut register_error = None;
    for (index, (handle, event)) in descriptors.iter().enumerate() {
        match handle.object().wait(&waiter, index, *event) {
            Ok(()) => registered += 1,
            Err(e) => {
                register_error = Some(e);
                break;
            }
        }
    }

    let result = match register_error {
        Some(e) => Err(e),
        None => waiter.wait(timeout),
    };

    for (index, (handle, event)) in descriptors.iter().take(registered).enumerate() {
        handle.object().unwait(&waiter, index, *event);
    }
    result
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::object::{KernelObject, ObjectType, Rights};
    use core::any::Any;

    /// Object whose event is permanently "already satisfied".
    struct AlwaysReady;

    impl KernelObject for AlwaysReady {
        fn object_type(&self) -> ObjectType {
            ObjectType::Device
        }

        fn wait(&self, waiter: &Arc<Waiter>, index: usize, _event: WaitEvent) -> KernelResult<()> {
            waiter.signal(index);
            Ok(())
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    /// Object that registers but never fires.
    struct NeverReady {
        notifier: Notifier,
    }

    impl KernelObject for NeverReady {
        fn object_type(&self) -> ObjectType {
            ObjectType::Device
        }

        fn wait(&self, waiter: &Arc<Waiter>, index: usize, event: WaitEvent) -> KernelResult<()> {
            self.notifier.register(waiter, index, event);
            Ok(())
        }

        fn unwait(&self, waiter: &Arc<Waiter>, index: usize, event: WaitEvent) {
            self.notifier.unregister(waiter, index, event);
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn already_satisfied_event_returns_its_index() {
        let never = Handle::new(
            Arc::new(NeverReady {
                notifier: Notifier::new(),
            }),
            Rights::READ,
        );
        let ready = Handle::new(Arc::new(AlwaysReady), Rights::READ);
        let index = object_wait(
            &[
                (never, WaitEvent::MessageArrived),
                (ready, WaitEvent::MessageArrived),
            ],
            0,
        )
        .expect("second descriptor is already satisfied");
        assert_eq!(index, 1);
    }

    #[test]
    fn try_wait_with_nothing_pending_times_out() {
        let never = Handle::new(
            Arc::new(NeverReady {
                notifier: Notifier::new(),
            }),
            Rights::READ,
        );
        assert_eq!(
            object_wait(&[(never, WaitEvent::MessageArrived)], 0),
            Err(KernelError::TimedOut)
        );
    }

    #[test]
    fn empty_descriptor_set_is_invalid() {
        assert_eq!(object_wait(&[], 0), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn notifier_signals_matching_event_only() {
        let notifier = Notifier::new();
        let waiter = Waiter::new();
        notifier.register(&waiter, 3, WaitEvent::Hangup);
        assert_eq!(notifier.notify(WaitEvent::MessageArrived), 0);
        assert_eq!(notifier.notify(WaitEvent::Hangup), 1);
        assert!(waiter.sem.try_down());
        assert_eq!(*waiter.first.lock(), Some(3));
        notifier.unregister(&waiter, 3, WaitEvent::Hangup);
        assert_eq!(notifier.notify(WaitEvent::Hangup), 0);
    }

    #[test]
    fn objects_without_wait_reject_object_wait() {
        struct NoWait;
        impl KernelObject for NoWait {
            fn object_type(&self) -> ObjectType {
                ObjectType::Device
            }
            fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
                self
            }
        }
        let handle = Handle::new(Arc::new(NoWait), Rights::READ);
        assert_eq!(
            object_wait(&[(handle, WaitEvent::MessageArrived)], 0),
            Err(KernelError::NotImplemented)
        );
    }
}
