//! Address spaces and the page-map operations.
//!
//! Every process owns a user address space; the kernel half of each one
//! mirrors the shared kernel map, which is identical everywhere. The space
//! mutex serializes all map edits (the kernel map's is recursive because
//! heap growth can re-enter the map while it is being edited). TLB shootdown
//! keeps remote CPUs coherent: the initiator broadcasts an IPI and spins
//! until every CPU that has this space loaded acknowledges.

use alloc::{collections::BTreeMap, sync::Arc};
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crate::{
    arch::mmu::{self, PageMap},
    config::{PAGE_SIZE, USER_BASE, USER_SIZE},
    error::{KernelError, KernelResult},
    object::Handle,
    sync::{Mutex, OnceLock, SpinLock},
    mm::{PhysAddr, Protection, VirtAddr},
};

/// One mapped area region inside a user space.
struct Region {
    size: u64,
    prot: Protection,
    shared: bool,
    area: Arc<Handle>,
    /// Offset into the area object at which this region starts.
    offset: u64,
    /// Private copies made on write for non-shared mappings, keyed by
    /// region-relative offset. These frames belong to the region, not the
    /// area.
    private_pages: BTreeMap<u64, PhysAddr>,
}

struct SpaceInner {
    arch: PageMap,
    /// Area regions keyed by base address. Kernel space has none.
    regions: BTreeMap<u64, Region>,
}

/// A per-process (or the kernel's) virtual address map.
pub struct AddressSpace {
    user: bool,
    lock: Mutex,
    inner: UnsafeCell<SpaceInner>,
    /// Bitmap of CPUs that currently have this space loaded.
    cpus: AtomicU64,
}

// SAFETY: `inner` is only touched while `lock` is held; the lock is a
// sleeping mutex owned by this structure.
unsafe impl Send for AddressSpace {}
// SAFETY: as above.
unsafe impl Sync for AddressSpace {}

static KERNEL_SPACE: OnceLock<Arc<AddressSpace>> = OnceLock::new();

/// The shared kernel address space.
pub fn kernel_space() -> &'static Arc<AddressSpace> {
    KERNEL_SPACE.expect("kernel address space")
}

impl AddressSpace {
    /// Adopt the active (bootloader-built) map as the kernel space.
    fn adopt_kernel() -> Arc<Self> {
        Arc::new(Self {
            user: false,
            lock: Mutex::recursive("kernel-aspace"),
            inner: UnsafeCell::new(SpaceInner {
                arch: PageMap::from_active(),
                regions: BTreeMap::new(),
            }),
            cpus: AtomicU64::new(1),
        })
    }

    /// Create a user space whose kernel half aliases the kernel map.
    pub fn new_user() -> KernelResult<Arc<Self>> {
        let kernel = kernel_space();
        kernel.lock.lock();
        let arch = {
            // SAFETY: kernel map lock held.
            let kinner = unsafe { &*kernel.inner.get() };
            PageMap::new_user(&kinner.arch)
        };
        kernel.lock.unlock();
        Ok(Arc::new(Self {
            user: true,
            lock: Mutex::new("aspace"),
            inner: UnsafeCell::new(SpaceInner {
                arch: arch?,
                regions: BTreeMap::new(),
            }),
            cpus: AtomicU64::new(0),
        }))
    }

    pub fn is_user(&self) -> bool {
        self.user
    }

    /// Inner state. Callers must hold `self.lock`.
    #[allow(clippy::mut_from_ref)]
    fn inner(&self) -> &mut SpaceInner {
        debug_assert!(self.lock.held_by_current());
        // SAFETY: the space mutex is held, per the debug assertion.
        unsafe { &mut *self.inner.get() }
    }

    fn check_bounds(&self, vaddr: VirtAddr) {
        let a = vaddr.as_u64();
        if self.user {
            assert!(
                (USER_BASE..USER_BASE + USER_SIZE).contains(&a),
                "user mapping outside user range: {:#x}",
                a
            );
        } else {
            assert!(a >= USER_BASE + USER_SIZE, "kernel mapping in user range");
        }
    }

    /// Install a mapping. Mapping over an existing entry is a programmer
    /// error and panics. Kernel mappings are GLOBAL; user mappings carry the
    /// USER bit.
    pub fn map_insert(&self, vaddr: VirtAddr, paddr: PhysAddr, prot: Protection) {
        assert!(vaddr.is_page_aligned() && paddr.is_page_aligned());
        self.check_bounds(vaddr);
        self.lock.lock();
        let result = self.inner().arch.map(vaddr, paddr, prot, !self.user);
        self.lock.unlock();
        match result {
            Ok(()) => {}
            Err(KernelError::AlreadyExists) => {
                panic!("mapping over existing entry at {:#x}", vaddr.as_u64())
            }
            Err(e) => panic!("page-table allocation failed: {}", e),
        }
    }

    /// Remove the mapping at `vaddr`, returning its frame. The local TLB
    /// entry is invalidated and remote CPUs holding this space are shot
    /// down before returning.
    pub fn map_remove(&self, vaddr: VirtAddr) -> KernelResult<PhysAddr> {
        assert!(vaddr.is_page_aligned());
        self.lock.lock();
        let result = self.inner().arch.unmap(vaddr);
        self.lock.unlock();
        let paddr = result?;
        mmu::invalidate_page(vaddr);
        self.shootdown(vaddr);
        Ok(paddr)
    }

    /// Read-only lookup.
    pub fn map_lookup(&self, vaddr: VirtAddr) -> Option<(PhysAddr, Protection)> {
        self.lock.lock();
        let result = self.inner().arch.query(vaddr.align_down());
        self.lock.unlock();
        result
    }

    /// Rewrite protections over `[start, end)`, silently skipping unmapped
    /// pages.
    pub fn map_protect(&self, start: VirtAddr, end: VirtAddr, prot: Protection) {
        assert!(start.is_page_aligned());
        self.lock.lock();
        let mut vaddr = start;
        while vaddr < end {
            if self.inner().arch.protect(vaddr, prot) {
                mmu::invalidate_page(vaddr);
                self.shootdown(vaddr);
            }
            vaddr = vaddr.offset(PAGE_SIZE as u64);
        }
        self.lock.unlock();
    }

    /// Install this space on the executing CPU.
    pub fn switch_to(self: &Arc<Self>) {
        let cpu = crate::arch::cpu_id();
        let bit = 1u64 << cpu;
        let previous = ACTIVE_SPACE[cpu].swap(Arc::as_ptr(self) as usize, Ordering::AcqRel);
        if previous == Arc::as_ptr(self) as usize {
            return;
        }
        self.cpus.fetch_or(bit, Ordering::AcqRel);
        if previous != 0 {
            // SAFETY: a space is always switched away from on every CPU
            // before its process drops it, so `previous` is still alive.
            let prev = unsafe { &*(previous as *const AddressSpace) };
            prev.cpus.fetch_and(!bit, Ordering::AcqRel);
        }
        // Called from the context-switch path, so the space mutex must not
        // be taken here. The root frame is fixed at construction; loading it
        // only reads that field.
        // SAFETY: `arch.make_current` reads the immutable root; concurrent
        // map edits touch table frames, not the root pointer.
        unsafe { (*self.inner.get()).arch.make_current() };
    }

    /// Broadcast a TLB shootdown for `vaddr` to every other CPU that has
    /// this space loaded, and wait for all of them to acknowledge.
    fn shootdown(&self, vaddr: VirtAddr) {
        let me = crate::arch::cpu_id();
        let others = self.cpus.load(Ordering::Acquire) & !(1 << me);
        if others == 0 {
            return;
        }
        let _serialize = SHOOTDOWN_LOCK.lock();
        SHOOTDOWN_ADDR.store(vaddr.as_u64(), Ordering::Release);
        SHOOTDOWN_PENDING.store(others, Ordering::Release);
        for cpu in 0..crate::arch::cpu_count() {
            if others & (1 << cpu) != 0 {
                crate::arch::send_shootdown_ipi(cpu);
            }
        }
        while SHOOTDOWN_PENDING.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
    }

    // -----------------------------------------------------------------------
    // Area regions
    // -----------------------------------------------------------------------

    /// Reserve a region backed by `area` and return its base. Pages are
    /// populated on first access by the fault path. `vaddr` fixes the base;
    /// `None` picks the lowest free gap.
    pub fn map_area(
        &self,
        area: Arc<Handle>,
        vaddr: Option<VirtAddr>,
        size: u64,
        offset: u64,
        prot: Protection,
        shared: bool,
    ) -> KernelResult<VirtAddr> {
        if !self.user || size == 0 || size % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        area.object().mappable(prot, area.rights(), shared)?;

        self.lock.lock();
        let inner = self.inner();
        let base = match vaddr {
            Some(v) => {
                if !v.is_page_aligned() || !self.region_fits(inner, v.as_u64(), size) {
                    self.lock.unlock();
                    return Err(KernelError::InvalidArgument);
                }
                v.as_u64()
            }
            None => match self.find_gap(inner, size) {
                Some(base) => base,
                None => {
                    self.lock.unlock();
                    return Err(KernelError::OutOfMemory);
                }
            },
        };
        inner.regions.insert(
            base,
            Region {
                size,
                prot,
                shared,
                area,
                offset,
                private_pages: BTreeMap::new(),
            },
        );
        self.lock.unlock();
        Ok(VirtAddr::new(base))
    }

    fn region_fits(&self, inner: &SpaceInner, base: u64, size: u64) -> bool {
        if base < USER_BASE || base + size > USER_BASE + USER_SIZE {
            return false;
        }
        inner
            .regions
            .range(..base + size)
            .next_back()
            .map(|(&rb, r)| rb + r.size <= base)
            .unwrap_or(true)
    }

    fn find_gap(&self, inner: &SpaceInner, size: u64) -> Option<u64> {
        let mut candidate = USER_BASE;
        for (&base, region) in inner.regions.iter() {
            if base.saturating_sub(candidate) >= size {
                return Some(candidate);
            }
            candidate = base + region.size;
        }
        if USER_BASE + USER_SIZE - candidate >= size {
            Some(candidate)
        } else {
            None
        }
    }

    /// Tear down the region based at `base`: unmap its pages, hand the
    /// area's frames back to it, and free any private copies.
    pub fn unmap_region(&self, base: VirtAddr) -> KernelResult<()> {
        self.lock.lock();
        let region = match self.inner().regions.remove(&base.as_u64()) {
            Some(r) => r,
            None => {
                self.lock.unlock();
                return Err(KernelError::NotFound);
            }
        };
        let mut offset = 0;
        while offset < region.size {
            let vaddr = base.offset(offset);
            if let Ok(paddr) = self.inner().arch.unmap(vaddr) {
                mmu::invalidate_page(vaddr);
                self.shootdown(vaddr);
                if region.private_pages.get(&offset) != Some(&paddr) {
                    region
                        .area
                        .object()
                        .release_page(region.offset + offset, paddr);
                }
            }
            offset += PAGE_SIZE as u64;
        }
        for (_, frame) in region.private_pages {
            crate::mm::phys::page_free(frame, 1);
        }
        self.lock.unlock();
        Ok(())
    }

    /// Resolve a fault at `addr`: populate the page from the backing area
    /// when the access is legal, or report why it is not.
    ///
    /// Shared regions map the area's own frames. Private regions map them
    /// read-only and give the faulting page its own writable copy on the
    /// first write, so writes never reach the backing object.
    fn fault(&self, addr: u64, write: bool, exec: bool) -> KernelResult<()> {
        let page = VirtAddr::new(addr).align_down();
        self.lock.lock();
        let result = self.fault_locked(page, write, exec);
        self.lock.unlock();
        match result {
            Ok(()) => Ok(()),
            // Raced with another thread faulting the same page in.
            Err(KernelError::AlreadyExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn fault_locked(&self, page: VirtAddr, write: bool, exec: bool) -> KernelResult<()> {
        let inner = self.inner();
        let addr = page.as_u64();
        let Some((&base, region)) = inner.regions.range_mut(..=addr).next_back() else {
            return Err(KernelError::InvalidAddress);
        };
        if addr >= base + region.size {
            return Err(KernelError::InvalidAddress);
        }
        if (write && !region.prot.contains(Protection::WRITE))
            || (exec && !region.prot.contains(Protection::EXECUTE))
        {
            return Err(KernelError::AccessDenied);
        }
        let rel = addr - base;
        let prot = region.prot;

        if write && !region.shared {
            // First write to a private page: replace whatever is mapped
            // with a copy the region owns.
            if let Some(&copy) = region.private_pages.get(&rel) {
                let _ = inner.arch.unmap(page);
                return inner.arch.map(page, copy, prot, false);
            }
            let source = region.area.object().get_page(region.offset + rel)?;
            let copy = crate::mm::phys::page_alloc(1, crate::mm::PageAllocFlags::empty())?;
            copy_frame(source, copy);
            region.private_pages.insert(rel, copy);
            if inner.arch.unmap(page).is_ok() {
                mmu::invalidate_page(page);
            }
            return inner.arch.map(page, copy, prot, false);
        }

        // Shared mapping, or a read/exec fault on a private one. Private
        // regions stay write-protected so the first write faults back in.
        let paddr = region.area.object().get_page(region.offset + rel)?;
        let effective = if region.shared {
            prot
        } else {
            prot.difference(Protection::WRITE)
        };
        inner.arch.map(page, paddr, effective, false)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Region pages go back to their areas (private copies are freed
        // outright); the arch map frees its own table frames afterwards.
        let inner = self.inner.get_mut();
        let regions = core::mem::take(&mut inner.regions);
        for (base, region) in regions {
            let mut offset = 0;
            while offset < region.size {
                if let Ok(paddr) = inner.arch.unmap(VirtAddr::new(base + offset)) {
                    if region.private_pages.get(&offset) != Some(&paddr) {
                        region
                            .area
                            .object()
                            .release_page(region.offset + offset, paddr);
                    }
                }
                offset += PAGE_SIZE as u64;
            }
            for (_, frame) in region.private_pages {
                crate::mm::phys::page_free(frame, 1);
            }
        }
    }
}

/// Copy one frame's contents through the physical window.
fn copy_frame(src: PhysAddr, dst: PhysAddr) {
    #[cfg(target_os = "none")]
    {
        let from: *const u8 = crate::mm::phys_to_virt(src).as_ptr();
        let to: *mut u8 = crate::mm::phys_to_virt(dst).as_mut_ptr();
        // SAFETY: both frames are live RAM inside the physical window; the
        // destination was just allocated and is exclusively ours.
        unsafe { core::ptr::copy_nonoverlapping(from, to, PAGE_SIZE) };
    }
    #[cfg(not(target_os = "none"))]
    let _ = (src, dst);
}

// ---------------------------------------------------------------------------
// Shootdown plumbing
// ---------------------------------------------------------------------------

static SHOOTDOWN_LOCK: SpinLock<()> = SpinLock::new(());
static SHOOTDOWN_ADDR: AtomicU64 = AtomicU64::new(0);
static SHOOTDOWN_PENDING: AtomicU64 = AtomicU64::new(0);

/// Per-CPU pointer to the loaded address space (non-owning).
static ACTIVE_SPACE: [AtomicUsize; crate::config::MAX_CPUS] =
    [const { AtomicUsize::new(0) }; crate::config::MAX_CPUS];

/// IPI handler side of the shootdown protocol: invalidate and acknowledge.
pub fn shootdown_service() {
    let addr = SHOOTDOWN_ADDR.load(Ordering::Acquire);
    mmu::invalidate_page(VirtAddr::new(addr));
    SHOOTDOWN_PENDING.fetch_and(!(1 << crate::arch::cpu_id()), Ordering::AcqRel);
}

/// Page-fault entry: route user-range faults to the owning space.
pub fn handle_fault(addr: u64, write: bool, exec: bool) -> KernelResult<()> {
    if !(USER_BASE..USER_BASE + USER_SIZE).contains(&addr) {
        return Err(KernelError::InvalidAddress);
    }
    let process = crate::sched::current_thread()
        .process()
        .ok_or(KernelError::InvalidAddress)?;
    process.address_space().fault(addr, write, exec)
}

/// Adopt the boot page tables as the kernel space and make sure the kernel
/// heap's top-level table slot exists before user spaces start copying the
/// kernel half.
pub fn init() {
    if KERNEL_SPACE.get().is_some() {
        return;
    }
    let space = AddressSpace::adopt_kernel();
    let _ = KERNEL_SPACE.set(space);
    #[cfg(target_os = "none")]
    {
        use crate::mm::{PageAllocFlags, phys};
        // Touch one heap page so the PML4 slot for the heap range is
        // allocated now; the kernel half of every user map is copied once
        // at creation and must never grow a new top-level entry.
        let probe = VirtAddr::new(crate::config::KERNEL_HEAP_BASE);
        let frame = phys::page_alloc(1, PageAllocFlags::FATAL).expect("boot heap probe frame");
        kernel_space().map_insert(probe, frame, Protection::RW);
        let _ = kernel_space().map_remove(probe);
        phys::page_free(frame, 1);
    }
    ACTIVE_SPACE[crate::arch::cpu_id()].store(
        Arc::as_ptr(kernel_space()) as usize,
        Ordering::Release,
    );
}

/// Late initialisation: apply the section protections recorded by the boot
/// layer (text read-only, data no-execute) and drop the early identity map.
pub fn late_init(args: &crate::boot::KernelArgs) {
    let kernel = kernel_space();
    if let Some((start, end)) = args.kernel_text {
        kernel.map_protect(
            VirtAddr::new(start).align_down(),
            VirtAddr::new(end),
            Protection::RX,
        );
    }
    if let Some((start, end)) = args.kernel_data {
        kernel.map_protect(
            VirtAddr::new(start).align_down(),
            VirtAddr::new(end),
            Protection::RW,
        );
    }
    if let Some((start, end)) = args.identity_map {
        let mut addr = start;
        while addr < end {
            let _ = kernel.map_remove(VirtAddr::new(addr));
            addr += PAGE_SIZE as u64;
        }
        log::info!("early identity map dropped: {:#x}..{:#x}", start, end);
    }
}
