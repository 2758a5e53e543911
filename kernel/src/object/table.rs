//! Per-process handle tables.
//!
//! An id-indexed map of handles with a lowest-free-id bitmap under the
//! kernel's read/write lock. Lookups optionally filter by object type and
//! verify the caller's rights are a superset of what the operation needs.
//! Child tables are built either by copying INHERITABLE entries or from an
//! explicit source-to-destination id map.

use alloc::{sync::Arc, vec::Vec};
use bitflags::bitflags;
use core::cell::UnsafeCell;

use crate::{
    config::HANDLE_TABLE_MAX,
    error::{KernelError, KernelResult},
    sync::RwLock,
    util::IdAllocator,
};

use super::{Handle, ObjectType, Rights};

bitflags! {
    /// Per-table-entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        /// Copied into child tables built by inheritance.
        const INHERITABLE = 1 << 0;
    }
}

struct Entry {
    handle: Arc<Handle>,
    flags: HandleFlags,
}

struct TableInner {
    slots: Vec<Option<Entry>>,
    ids: IdAllocator,
}

/// Id-indexed handle table attached to a process.
///
/// Guarded by the kernel's sleeping, writer-preferring rwlock: table
/// operations run in preemptible syscall context, so contended callers
/// must sleep rather than busy-spin against a preempted holder.
pub struct HandleTable {
    lock: RwLock,
    inner: UnsafeCell<TableInner>,
}

// SAFETY: `inner` is only touched through `with_read`/`with_write`, which
// hold the table's rwlock for the duration of the access.
unsafe impl Send for HandleTable {}
// SAFETY: as above; the rwlock admits shared readers or one writer.
unsafe impl Sync for HandleTable {}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new("handle-table"),
            inner: UnsafeCell::new(TableInner {
                slots: Vec::new(),
                ids: IdAllocator::new(HANDLE_TABLE_MAX),
            }),
        }
    }

    fn with_read<R>(&self, f: impl FnOnce(&TableInner) -> R) -> R {
        self.lock.read_lock();
        // SAFETY: the read lock is held; only shared access happens here.
        let result = f(unsafe { &*self.inner.get() });
        self.lock.read_unlock();
        result
    }

    fn with_write<R>(&self, f: impl FnOnce(&mut TableInner) -> R) -> R {
        self.lock.write_lock();
        // SAFETY: the write lock is held, so this access is exclusive.
        let result = f(unsafe { &mut *self.inner.get() });
        self.lock.write_unlock();
        result
    }

    /// Attach `handle`, returning the lowest free id.
    pub fn attach(&self, handle: Arc<Handle>, flags: HandleFlags) -> KernelResult<u32> {
        self.with_write(|inner| {
            let id = inner.ids.alloc().ok_or(KernelError::OutOfMemory)?;
            if inner.slots.len() <= id {
                inner.slots.resize_with(id + 1, || None);
            }
            debug_assert!(inner.slots[id].is_none(), "bitmap out of sync with slots");
            inner.slots[id] = Some(Entry { handle, flags });
            Ok(id as u32)
        })
    }

    /// Attach `handle` at a caller-chosen id (inheritance maps use this).
    fn attach_at(&self, id: u32, handle: Arc<Handle>, flags: HandleFlags) -> KernelResult<()> {
        let id = id as usize;
        self.with_write(|inner| {
            if !inner.ids.reserve(id) {
                return Err(KernelError::AlreadyExists);
            }
            if inner.slots.len() <= id {
                inner.slots.resize_with(id + 1, || None);
            }
            inner.slots[id] = Some(Entry { handle, flags });
            Ok(())
        })
    }

    /// Close the entry at `id`. The handle reference held by the table is
    /// dropped, which runs the object's `close` if it was the last one.
    pub fn detach(&self, id: u32) -> KernelResult<()> {
        let entry = self.with_write(|inner| {
            let slot = inner
                .slots
                .get_mut(id as usize)
                .and_then(Option::take)
                .ok_or(KernelError::InvalidHandle)?;
            inner.ids.free(id as usize);
            Ok(slot)
        })?;
        // The close capability can take other locks (port registry,
        // connection), so the table lock is released first.
        drop(entry);
        Ok(())
    }

    /// Look up `id`, optionally insisting on an object type, and verify the
    /// entry's rights cover `required`.
    pub fn lookup(
        &self,
        id: u32,
        object_type: Option<ObjectType>,
        required: Rights,
    ) -> KernelResult<Arc<Handle>> {
        self.with_read(|inner| {
            let entry = inner
                .slots
                .get(id as usize)
                .and_then(Option::as_ref)
                .ok_or(KernelError::InvalidHandle)?;
            if let Some(t) = object_type {
                if entry.handle.object_type() != t {
                    return Err(KernelError::InvalidHandle);
                }
            }
            entry.handle.check_rights(required)?;
            Ok(entry.handle.clone())
        })
    }

    /// Update the flags of an attached entry.
    pub fn set_flags(&self, id: u32, flags: HandleFlags) -> KernelResult<()> {
        self.with_write(|inner| {
            let entry = inner
                .slots
                .get_mut(id as usize)
                .and_then(Option::as_mut)
                .ok_or(KernelError::InvalidHandle)?;
            entry.flags = flags;
            Ok(())
        })
    }

    /// Number of attached handles.
    pub fn count(&self) -> usize {
        self.with_read(|inner| inner.ids.used())
    }

    /// Build a child table.
    ///
    /// With `id_map`, each `(source, destination)` pair copies the parent
    /// entry at `source` to the child id `destination`; a missing source or
    /// colliding destination fails the whole build. Without a map, every
    /// INHERITABLE entry is copied under its existing id.
    pub fn inherit(parent: &HandleTable, id_map: Option<&[(u32, u32)]>) -> KernelResult<Self> {
        let child = Self::new();
        parent.with_read(|inner| {
            match id_map {
                Some(map) => {
                    for &(src, dst) in map {
                        let entry = inner
                            .slots
                            .get(src as usize)
                            .and_then(Option::as_ref)
                            .ok_or(KernelError::InvalidHandle)?;
                        child.attach_at(dst, entry.handle.clone(), entry.flags)?;
                    }
                }
                None => {
                    for (id, slot) in inner.slots.iter().enumerate() {
                        if let Some(entry) = slot {
                            if entry.flags.contains(HandleFlags::INHERITABLE) {
                                child.attach_at(id as u32, entry.handle.clone(), entry.flags)?;
                            }
                        }
                    }
                }
            }
            Ok(())
        })?;
        Ok(child)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::object::KernelObject;
    use core::any::Any;

    struct Dummy;

    impl KernelObject for Dummy {
        fn object_type(&self) -> ObjectType {
            ObjectType::Device
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn handle(rights: Rights) -> Arc<Handle> {
        Handle::new(Arc::new(Dummy), rights)
    }

    #[test]
    fn attach_returns_lowest_free_id() {
        let table = HandleTable::new();
        let a = table
            .attach(handle(Rights::READ), HandleFlags::empty())
            .expect("attach");
        let b = table
            .attach(handle(Rights::READ), HandleFlags::empty())
            .expect("attach");
        assert_eq!((a, b), (0, 1));
        table.detach(a).expect("detach");
        let c = table
            .attach(handle(Rights::READ), HandleFlags::empty())
            .expect("attach");
        assert_eq!(c, 0, "freed id must be reused lowest-first");
    }

    #[test]
    fn detach_round_trip_restores_count() {
        let table = HandleTable::new();
        let h = handle(Rights::READ);
        let before = Arc::strong_count(&h);
        let id = table.attach(h.clone(), HandleFlags::empty()).expect("attach");
        assert_eq!(Arc::strong_count(&h), before + 1);
        table.detach(id).expect("detach");
        assert_eq!(Arc::strong_count(&h), before);
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn lookup_filters_type_and_rights() {
        let table = HandleTable::new();
        let id = table
            .attach(handle(Rights::READ), HandleFlags::empty())
            .expect("attach");
        assert!(table.lookup(id, Some(ObjectType::Device), Rights::READ).is_ok());
        assert_eq!(
            table
                .lookup(id, Some(ObjectType::Port), Rights::READ)
                .unwrap_err(),
            KernelError::InvalidHandle
        );
        assert_eq!(
            table.lookup(id, None, Rights::WRITE).unwrap_err(),
            KernelError::AccessDenied
        );
        assert_eq!(
            table.lookup(99, None, Rights::empty()).unwrap_err(),
            KernelError::InvalidHandle
        );
    }

    #[test]
    fn inherit_copies_only_flagged_entries() {
        let parent = HandleTable::new();
        let inheritable = parent
            .attach(handle(Rights::READ), HandleFlags::INHERITABLE)
            .expect("attach");
        let private = parent
            .attach(handle(Rights::READ), HandleFlags::empty())
            .expect("attach");
        let child = HandleTable::inherit(&parent, None).expect("inherit");
        assert!(child.lookup(inheritable, None, Rights::empty()).is_ok());
        assert_eq!(
            child.lookup(private, None, Rights::empty()).unwrap_err(),
            KernelError::InvalidHandle
        );
    }

    #[test]
    fn inherit_follows_explicit_map() {
        let parent = HandleTable::new();
        let src = parent
            .attach(handle(Rights::READ), HandleFlags::empty())
            .expect("attach");
        let child = HandleTable::inherit(&parent, Some(&[(src, 7)])).expect("inherit");
        assert!(child.lookup(7, None, Rights::empty()).is_ok());
        assert_eq!(
            child.lookup(src, None, Rights::empty()).unwrap_err(),
            KernelError::InvalidHandle,
            "entry must land at the mapped id only"
        );
        assert!(HandleTable::inherit(&parent, Some(&[(42, 0)])).is_err());
    }

    #[test]
    fn set_flags_updates_inheritance() {
        let parent = HandleTable::new();
        let id = parent
            .attach(handle(Rights::READ), HandleFlags::empty())
            .expect("attach");
        parent
            .set_flags(id, HandleFlags::INHERITABLE)
            .expect("set_flags");
        let child = HandleTable::inherit(&parent, None).expect("inherit");
        assert!(child.lookup(id, None, Rights::empty()).is_ok());
        assert_eq!(
            parent.set_flags(99, HandleFlags::empty()).unwrap_err(),
            KernelError::InvalidHandle
        );
    }
}
