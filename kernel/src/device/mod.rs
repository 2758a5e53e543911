//! Block/character device façade.
//!
//! Storage and character drivers register an implementation of [`Device`];
//! the core routes reads, writes, and control requests through it and never
//! parses on-disk formats itself. Driver failures surface as `DeviceError`.

use alloc::{collections::BTreeMap, sync::Arc};
use core::any::Any;

use crate::{
    error::{KernelError, KernelResult},
    object::{Handle, KernelObject, ObjectType, Rights},
    sync::RwLock,
    sync::SpinLock,
};

/// Device identifier assigned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

/// The contract drivers provide.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Read `count` blocks starting at `lba` into `buf`.
    fn read(&self, buf: &mut [u8], lba: u64, count: usize) -> KernelResult<()>;

    /// Write `count` blocks starting at `lba` from `buf`.
    fn write(&self, buf: &[u8], lba: u64, count: usize) -> KernelResult<()>;

    /// Driver-specific control request. Returns the number of output bytes.
    fn request(&self, _opcode: u32, _input: &[u8], _output: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotImplemented)
    }
}

/// Handle-visible wrapper around a registered device.
pub struct DeviceObject {
    id: DeviceId,
    device: Arc<dyn Device>,
}

impl DeviceObject {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl KernelObject for DeviceObject {
    fn object_type(&self) -> ObjectType {
        ObjectType::Device
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// Registrations are rare and lookups happen from syscall context, so a
// sleeping writer-preferring rwlock fits.
static REGISTRY_LOCK: RwLock = RwLock::new("device-registry");
static REGISTRY: SpinLock<BTreeMap<u32, Arc<dyn Device>>> = SpinLock::new(BTreeMap::new());
static NEXT_ID: SpinLock<u32> = SpinLock::new(1);

/// Register a driver's device, returning its id.
pub fn register(device: Arc<dyn Device>) -> DeviceId {
    REGISTRY_LOCK.write_lock();
    let id = {
        let mut next = NEXT_ID.lock();
        let id = *next;
        *next += 1;
        id
    };
    REGISTRY.lock().insert(id, device.clone());
    REGISTRY_LOCK.write_unlock();
    log::info!("device {} registered as id {}", device.name(), id);
    DeviceId(id)
}

/// Remove a device from the registry.
pub fn unregister(id: DeviceId) -> KernelResult<()> {
    REGISTRY_LOCK.write_lock();
    let removed = REGISTRY.lock().remove(&id.0);
    REGISTRY_LOCK.write_unlock();
    removed.map(|_| ()).ok_or(KernelError::NotFound)
}

/// Look up a registered device.
pub fn get(id: DeviceId) -> KernelResult<Arc<dyn Device>> {
    REGISTRY_LOCK.read_lock();
    let device = REGISTRY.lock().get(&id.0).cloned();
    REGISTRY_LOCK.read_unlock();
    device.ok_or(KernelError::NotFound)
}

/// Wrap a registered device in a handle.
pub fn make_handle(id: DeviceId, rights: Rights) -> KernelResult<Arc<Handle>> {
    let device = get(id)?;
    Ok(Handle::new(Arc::new(DeviceObject { id, device }), rights))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    struct NullDevice;

    impl Device for NullDevice {
        fn name(&self) -> &str {
            "null"
        }

        fn read(&self, buf: &mut [u8], _lba: u64, _count: usize) -> KernelResult<()> {
            buf.fill(0);
            Ok(())
        }

        fn write(&self, _buf: &[u8], _lba: u64, _count: usize) -> KernelResult<()> {
            Ok(())
        }
    }

    struct FailingDevice;

    impl Device for FailingDevice {
        fn name(&self) -> &str {
            "broken"
        }

        fn read(&self, _buf: &mut [u8], _lba: u64, _count: usize) -> KernelResult<()> {
            Err(KernelError::DeviceError)
        }

        fn write(&self, _buf: &[u8], _lba: u64, _count: usize) -> KernelResult<()> {
            Err(KernelError::DeviceError)
        }
    }

    #[test]
    fn register_lookup_unregister() {
        let id = register(Arc::new(NullDevice));
        let dev = get(id).expect("registered device");
        let mut buf = [0xFFu8; 16];
        dev.read(&mut buf, 0, 1).expect("null read");
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(
            dev.request(1, &[], &mut []),
            Err(KernelError::NotImplemented)
        );
        unregister(id).expect("unregister");
        assert!(get(id).is_err());
        assert_eq!(unregister(id), Err(KernelError::NotFound));
    }

    #[test]
    fn driver_failures_surface_as_device_error() {
        let id = register(Arc::new(FailingDevice));
        let dev = get(id).expect("registered device");
        assert_eq!(
            dev.read(&mut [0u8; 4], 0, 1),
            Err(KernelError::DeviceError)
        );
        unregister(id).expect("unregister");
    }

    #[test]
    fn device_handles_carry_type_and_rights() {
        let id = register(Arc::new(NullDevice));
        let handle = make_handle(id, Rights::READ).expect("handle");
        assert_eq!(handle.object_type(), ObjectType::Device);
        assert!(handle.check_rights(Rights::WRITE).is_err());
        unregister(id).expect("unregister");
    }
}
