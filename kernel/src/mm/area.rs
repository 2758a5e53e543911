//! Area objects: reference-counted, mappable memory regions.
//!
//! Anonymous areas materialize zero-filled pages on first access and keep
//! an offset-ordered map of the frames they own. Object-backed areas
//! delegate page fetch and release to a wrapped source handle, shifted by a
//! fixed base offset. Either kind can be mapped into an address space; the
//! fault path drives `get_page`.

use alloc::{collections::BTreeMap, sync::Arc};
use core::any::Any;

use crate::{
    config::PAGE_SIZE,
    error::{KernelError, KernelResult},
    object::{Handle, KernelObject, ObjectType, Rights},
    sync::{Mutex, SpinLock},
    util::IdAllocator,
    mm::{phys, PageAllocFlags, PhysAddr, Protection},
};

const MAX_AREAS: usize = 8192;

static AREA_IDS: SpinLock<Option<IdAllocator>> = SpinLock::new(None);

fn alloc_id() -> KernelResult<u32> {
    let mut ids = AREA_IDS.lock();
    let ids = ids.get_or_insert_with(|| IdAllocator::new(MAX_AREAS));
    ids.alloc().map(|id| id as u32).ok_or(KernelError::OutOfMemory)
}

fn free_id(id: u32) {
    let mut ids = AREA_IDS.lock();
    if let Some(ids) = ids.as_mut() {
        ids.free(id as usize);
    }
}

/// Shared mappability policy: read and execute mappings need the READ
/// right; shared writable mappings need WRITE as well; private mappings
/// (copy semantics, never visible to other holders) need only READ.
fn check_mappable(prot: Protection, rights: Rights, shared: bool) -> KernelResult<()> {
    if prot.intersects(Protection::READ | Protection::EXECUTE) && !rights.contains(Rights::READ) {
        return Err(KernelError::AccessDenied);
    }
    if shared && prot.contains(Protection::WRITE) && !rights.contains(Rights::WRITE) {
        return Err(KernelError::AccessDenied);
    }
    Ok(())
}

fn check_resize(old: u64, new: u64) -> KernelResult<u64> {
    if new % PAGE_SIZE as u64 != 0 || new < old {
        return Err(KernelError::InvalidArgument);
    }
    Ok(new)
}

/// Anonymous, demand-zero area.
pub struct AnonymousArea {
    id: u32,
    resize_lock: Mutex,
    size: SpinLock<u64>,
    /// Frames owned by this area, keyed by page-aligned offset.
    pages: SpinLock<BTreeMap<u64, PhysAddr>>,
}

impl AnonymousArea {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u64 {
        *self.size.lock()
    }

    /// Grow the area. Shrinking is not supported.
    pub fn resize(&self, new_size: u64) -> KernelResult<()> {
        self.resize_lock.lock();
        let result = {
            let mut size = self.size.lock();
            match check_resize(*size, new_size) {
                Ok(new) => {
                    *size = new;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        self.resize_lock.unlock();
        result
    }

    /// Frames currently materialized.
    pub fn resident_pages(&self) -> usize {
        self.pages.lock().len()
    }
}

impl KernelObject for AnonymousArea {
    fn object_type(&self) -> ObjectType {
        ObjectType::Area
    }

    fn close(&self, _handle: &Handle) {
        let pages = core::mem::take(&mut *self.pages.lock());
        for (_, frame) in pages {
            phys::page_free(frame, 1);
        }
        free_id(self.id);
    }

    fn mappable(&self, prot: Protection, rights: Rights, shared: bool) -> KernelResult<()> {
        check_mappable(prot, rights, shared)
    }

    fn get_page(&self, offset: u64) -> KernelResult<PhysAddr> {
        let offset = offset & !(PAGE_SIZE as u64 - 1);
        if offset >= self.size() {
            return Err(KernelError::InvalidAddress);
        }
        {
            let pages = self.pages.lock();
            if let Some(&frame) = pages.get(&offset) {
                return Ok(frame);
            }
        }
        // Populate outside the lock, then settle races in favour of the
        // first inserter.
        let frame = phys::page_alloc(1, PageAllocFlags::ZERO)?;
        let mut pages = self.pages.lock();
        match pages.get(&offset) {
            Some(&existing) => {
                drop(pages);
                phys::page_free(frame, 1);
                Ok(existing)
            }
            None => {
                pages.insert(offset, frame);
                Ok(frame)
            }
        }
    }

    fn release_page(&self, _offset: u64, _addr: PhysAddr) {
        // Anonymous frames stay resident until the area closes.
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Area backed by another mappable object, shifted by `base`.
pub struct BackedArea {
    id: u32,
    resize_lock: Mutex,
    size: SpinLock<u64>,
    source: Arc<Handle>,
    base: u64,
}

impl BackedArea {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u64 {
        *self.size.lock()
    }

    pub fn resize(&self, new_size: u64) -> KernelResult<()> {
        self.resize_lock.lock();
        let result = {
            let mut size = self.size.lock();
            match check_resize(*size, new_size) {
                Ok(new) => {
                    *size = new;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        self.resize_lock.unlock();
        result
    }
}

impl KernelObject for BackedArea {
    fn object_type(&self) -> ObjectType {
        ObjectType::Area
    }

    fn close(&self, _handle: &Handle) {
        free_id(self.id);
    }

    fn mappable(&self, prot: Protection, rights: Rights, shared: bool) -> KernelResult<()> {
        check_mappable(prot, rights, shared)?;
        // The source must also be willing to be mapped this way.
        self.source
            .object()
            .mappable(prot, self.source.rights(), shared)
    }

    fn get_page(&self, offset: u64) -> KernelResult<PhysAddr> {
        if offset >= self.size() {
            return Err(KernelError::InvalidAddress);
        }
        self.source.object().get_page(self.base + offset)
    }

    fn release_page(&self, offset: u64, addr: PhysAddr) {
        self.source.object().release_page(self.base + offset, addr);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Create an anonymous area of `size` bytes (multiple of the page size).
pub fn create_anonymous(size: u64, rights: Rights) -> KernelResult<Arc<Handle>> {
    if size == 0 || size % PAGE_SIZE as u64 != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let id = alloc_id()?;
    let area = Arc::new(AnonymousArea {
        id,
        resize_lock: Mutex::new("area-resize"),
        size: SpinLock::new(size),
        pages: SpinLock::new(BTreeMap::new()),
    });
    Ok(Handle::new(area, rights))
}

/// Create an area view onto `source` starting at `base`.
pub fn create_backed(
    source: Arc<Handle>,
    base: u64,
    size: u64,
    rights: Rights,
) -> KernelResult<Arc<Handle>> {
    if size == 0 || size % PAGE_SIZE as u64 != 0 || base % PAGE_SIZE as u64 != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let id = alloc_id()?;
    let area = Arc::new(BackedArea {
        id,
        resize_lock: Mutex::new("area-resize"),
        size: SpinLock::new(size),
        source,
        base,
    });
    Ok(Handle::new(area, rights))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;

    #[test]
    fn mappable_policy_matches_rights() {
        // Read-only handle: read and exec map, shared write does not.
        assert!(check_mappable(Protection::READ, Rights::READ, false).is_ok());
        assert!(check_mappable(Protection::RX, Rights::READ, true).is_ok());
        assert_eq!(
            check_mappable(Protection::RW, Rights::READ, true),
            Err(KernelError::AccessDenied)
        );
        // Private writable mapping needs only read.
        assert!(check_mappable(Protection::RW, Rights::READ, false).is_ok());
        // Shared write with the write right is fine.
        assert!(check_mappable(Protection::RW, Rights::READ | Rights::WRITE, true).is_ok());
        // No read right at all: nothing maps.
        assert_eq!(
            check_mappable(Protection::READ, Rights::WRITE, false),
            Err(KernelError::AccessDenied)
        );
    }

    #[test]
    fn size_must_be_page_multiple() {
        assert!(create_anonymous(0, Rights::READ).is_err());
        assert!(create_anonymous(PAGE_SIZE as u64 + 1, Rights::READ).is_err());
        let area = create_anonymous(4 * PAGE_SIZE as u64, Rights::READ).expect("area");
        let anon = area.downcast::<AnonymousArea>().expect("anonymous");
        assert_eq!(anon.size(), 4 * PAGE_SIZE as u64);
    }

    #[test]
    fn resize_grows_only() {
        let area = create_anonymous(2 * PAGE_SIZE as u64, Rights::READ).expect("area");
        let anon = area.downcast::<AnonymousArea>().expect("anonymous");
        assert!(anon.resize(4 * PAGE_SIZE as u64).is_ok());
        assert_eq!(
            anon.resize(2 * PAGE_SIZE as u64),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(anon.size(), 4 * PAGE_SIZE as u64);
    }

    #[test]
    fn anonymous_pages_materialize_once() {
        crate::mm::phys::seed_for_tests();
        let area = create_anonymous(4 * PAGE_SIZE as u64, Rights::READ).expect("area");
        let anon = area.downcast::<AnonymousArea>().expect("anonymous");
        let a = anon.get_page(0).expect("first page");
        let b = anon.get_page(10).expect("same page, unaligned offset");
        assert_eq!(a, b, "offsets within one page share a frame");
        let c = anon.get_page(PAGE_SIZE as u64).expect("second page");
        assert_ne!(a, c);
        assert_eq!(anon.resident_pages(), 2);
        assert_eq!(
            anon.get_page(4 * PAGE_SIZE as u64),
            Err(KernelError::InvalidAddress)
        );
    }

    #[test]
    fn backed_area_translates_offsets() {
        crate::mm::phys::seed_for_tests();
        let anon = create_anonymous(8 * PAGE_SIZE as u64, Rights::READ | Rights::WRITE)
            .expect("source area");
        let view = create_backed(
            anon.clone(),
            2 * PAGE_SIZE as u64,
            4 * PAGE_SIZE as u64,
            Rights::READ,
        )
        .expect("view");
        let backed = view.downcast::<BackedArea>().expect("backed");
        let direct = anon
            .object()
            .get_page(2 * PAGE_SIZE as u64)
            .expect("direct");
        let via_view = backed.get_page(0).expect("through the view");
        assert_eq!(direct, via_view, "view offset 0 is source offset base");
    }
}
