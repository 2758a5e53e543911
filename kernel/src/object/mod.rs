//! Typed kernel objects and reference-counted handles.
//!
//! Every user-visible kernel entity implements [`KernelObject`]: a type tag
//! plus the capability set (close, wait/unwait, and the optional mapping
//! trio). A [`Handle`] binds an object to a rights mask and per-handle data;
//! handles are shared by reference count and the type's `close` runs when
//! the last reference drops.

pub mod table;
pub mod wait;

pub use table::{HandleFlags, HandleTable};
pub use wait::{object_wait, Notifier, Waiter};

use alloc::sync::Arc;
use bitflags::bitflags;
use core::{
    any::Any,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    error::{KernelError, KernelResult},
    mm::{PhysAddr, Protection},
};

/// Object type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Port,
    Connection,
    Area,
    Thread,
    Process,
    Device,
}

bitflags! {
    /// Rights a handle grants over its object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Receive messages / accept connections.
        const RECEIVE = 1 << 3;
        /// Send messages / initiate operations.
        const SEND = 1 << 4;
        /// Kill, set priority, and other control operations.
        const CONTROL = 1 << 5;
    }
}

impl Rights {
    pub const ALL: Self = Self::all();
}

/// Event kinds an object can signal to waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// A connection attempt is pending on a port.
    ConnectionPending,
    /// A message is queued on an endpoint.
    MessageArrived,
    /// The remote side of a connection hung up.
    Hangup,
    /// The thread or process terminated.
    Terminated,
}

/// The capability set all kernel objects implement. Optional capabilities
/// default to `NotImplemented`, matching objects that do not provide them.
pub trait KernelObject: Send + Sync {
    fn object_type(&self) -> ObjectType;

    /// Invoked when the last handle reference is released.
    fn close(&self, _handle: &Handle) {}

    /// Register interest in `event`. An already-satisfied event signals
    /// `waiter` immediately; otherwise the registration is signalled when
    /// the event fires, until [`unwait`](Self::unwait) cancels it.
    fn wait(&self, _waiter: &Arc<Waiter>, _index: usize, _event: WaitEvent) -> KernelResult<()> {
        Err(KernelError::NotImplemented)
    }

    /// Cancel a registration made by [`wait`](Self::wait).
    fn unwait(&self, _waiter: &Arc<Waiter>, _index: usize, _event: WaitEvent) {}

    /// May the object be mapped with `prot`, given the handle's rights?
    fn mappable(&self, _prot: Protection, _rights: Rights, _shared: bool) -> KernelResult<()> {
        Err(KernelError::NotImplemented)
    }

    /// The frame backing `offset`, for mappable objects.
    fn get_page(&self, _offset: u64) -> KernelResult<PhysAddr> {
        Err(KernelError::NotImplemented)
    }

    /// Release a frame previously returned by [`get_page`](Self::get_page).
    fn release_page(&self, _offset: u64, _addr: PhysAddr) {}

    /// Upcast for typed downcasting of handles.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A rights-masked, reference-counted grip on a kernel object.
///
/// Shared as `Arc<Handle>`; when the final clone drops, the object's
/// `close` capability runs.
pub struct Handle {
    object: Arc<dyn KernelObject>,
    rights: Rights,
    /// Per-handle data slot, free for the object type's use.
    data: AtomicU64,
}

impl Handle {
    pub fn new(object: Arc<dyn KernelObject>, rights: Rights) -> Arc<Self> {
        Arc::new(Self {
            object,
            rights,
            data: AtomicU64::new(0),
        })
    }

    pub fn object(&self) -> &dyn KernelObject {
        &*self.object
    }

    pub fn object_arc(&self) -> Arc<dyn KernelObject> {
        self.object.clone()
    }

    pub fn object_type(&self) -> ObjectType {
        self.object.object_type()
    }

    pub fn rights(&self) -> Rights {
        self.rights
    }

    /// Verify the handle grants all of `required`.
    pub fn check_rights(&self, required: Rights) -> KernelResult<()> {
        if self.rights.contains(required) {
            Ok(())
        } else {
            Err(KernelError::AccessDenied)
        }
    }

    pub fn data(&self) -> u64 {
        self.data.load(Ordering::Relaxed)
    }

    pub fn set_data(&self, value: u64) {
        self.data.store(value, Ordering::Relaxed);
    }

    /// Downcast to the concrete object type.
    pub fn downcast<T: KernelObject + 'static>(&self) -> KernelResult<Arc<T>> {
        self.object
            .clone()
            .as_any()
            .downcast::<T>()
            .map_err(|_| KernelError::InvalidHandle)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.object.close(self);
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle")
            .field("type", &self.object_type())
            .field("rights", &self.rights)
            .finish()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct TestObject {
        closes: Arc<AtomicUsize>,
    }

    impl KernelObject for TestObject {
        fn object_type(&self) -> ObjectType {
            ObjectType::Device
        }

        fn close(&self, _handle: &Handle) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn close_runs_once_on_last_release() {
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = Handle::new(
            Arc::new(TestObject {
                closes: closes.clone(),
            }),
            Rights::READ,
        );
        let clone = handle.clone();
        drop(handle);
        assert_eq!(closes.load(Ordering::Relaxed), 0);
        drop(clone);
        assert_eq!(closes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn rights_checks_are_superset_based() {
        let handle = Handle::new(
            Arc::new(TestObject {
                closes: Arc::new(AtomicUsize::new(0)),
            }),
            Rights::READ | Rights::WRITE,
        );
        assert!(handle.check_rights(Rights::READ).is_ok());
        assert!(handle.check_rights(Rights::READ | Rights::WRITE).is_ok());
        assert_eq!(
            handle.check_rights(Rights::EXECUTE),
            Err(KernelError::AccessDenied)
        );
    }

    #[test]
    fn downcast_checks_type() {
        let handle = Handle::new(
            Arc::new(TestObject {
                closes: Arc::new(AtomicUsize::new(0)),
            }),
            Rights::READ,
        );
        assert!(handle.downcast::<TestObject>().is_ok());
    }

    #[test]
    fn optional_capabilities_default_to_not_implemented() {
        let obj = Arc::new(TestObject {
            closes: Arc::new(AtomicUsize::new(0)),
        });
        assert_eq!(obj.get_page(0), Err(KernelError::NotImplemented));
        assert_eq!(
            obj.mappable(Protection::READ, Rights::READ, false),
            Err(KernelError::NotImplemented)
        );
    }
}
