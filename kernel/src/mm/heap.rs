//! Kernel heap: slab caches over the virtual-range allocator.
//!
//! Two layers. [`RangeAllocator`](super::range::RangeAllocator) reserves
//! page-aligned chunks of the kernel heap range and never backs pages;
//! [`SlabCache`] stacks on it, backing chunks with physical frames and
//! carving them into equal objects. A per-CPU magazine of recently freed
//! objects keeps the hot path off the cache lock.
//!
//! `kmalloc`/`kfree` dispatch to size-classed caches through a small header;
//! the Rust global allocator uses the same caches header-free because
//! `dealloc` receives the layout. Allocations before `init` are served from
//! a static bootstrap heap.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use linked_list_allocator::LockedHeap;

use crate::{
    config::{self, BOOT_HEAP_SIZE, MAX_CPUS, PAGE_SIZE},
    error::{KernelError, KernelResult},
    mm::{range::RangeAllocator, HeapFlags, PageAllocFlags, Protection, VirtAddr},
    sync::SpinLock,
};

/// Object sizes served by the kmalloc caches. Requests above the largest
/// class go straight to whole pages from the range allocator.
const SIZE_CLASSES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Objects kept in each per-CPU magazine.
const MAGAZINE_SIZE: usize = 16;

/// Header preceding every `kmalloc` allocation (16 bytes keeps alignment).
#[repr(C, align(16))]
struct AllocHeader {
    /// Size class index, or `usize::MAX` for a page-backed allocation.
    class: usize,
    /// Page count for page-backed allocations.
    pages: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<AllocHeader>();

/// The kernel heap virtual range, shared by every cache.
static KERNEL_RANGE: SpinLock<RangeAllocator> = SpinLock::new(RangeAllocator::new());

static ONLINE: AtomicBool = AtomicBool::new(false);

struct FreeObject {
    next: Option<NonNull<FreeObject>>,
}

/// Per-CPU stack of recently freed objects.
struct Magazine {
    slots: [*mut u8; MAGAZINE_SIZE],
    count: usize,
}

impl Magazine {
    const fn new() -> Self {
        Self {
            slots: [ptr::null_mut(); MAGAZINE_SIZE],
            count: 0,
        }
    }
}

struct CacheInner {
    free_list: Option<NonNull<FreeObject>>,
    free_objects: usize,
    total_objects: usize,
    chunk_count: usize,
}

// SAFETY: the raw object pointers inside are only dereferenced under the
// cache's own locks, and the backing memory is kernel-global.
unsafe impl Send for CacheInner {}
// SAFETY: as above; Magazine pointers are guarded by their SpinLock.
unsafe impl Send for Magazine {}

/// A typed pool of equal-sized objects.
pub struct SlabCache {
    name: &'static str,
    object_size: usize,
    /// Optional constructor, run as objects leave the pool.
    ctor: Option<fn(*mut u8)>,
    /// Optional destructor, run as objects re-enter the pool.
    dtor: Option<fn(*mut u8)>,
    /// Reclaim priority hint; higher caches give memory back first.
    reclaim_priority: u8,
    inner: SpinLock<CacheInner>,
    magazines: [SpinLock<Magazine>; MAX_CPUS],
}

impl SlabCache {
    pub const fn new(
        name: &'static str,
        object_size: usize,
        ctor: Option<fn(*mut u8)>,
        dtor: Option<fn(*mut u8)>,
        reclaim_priority: u8,
    ) -> Self {
        assert!(object_size >= core::mem::size_of::<FreeObject>());
        Self {
            name,
            object_size,
            ctor,
            dtor,
            reclaim_priority,
            inner: SpinLock::new(CacheInner {
                free_list: None,
                free_objects: 0,
                total_objects: 0,
                chunk_count: 0,
            }),
            magazines: [const { SpinLock::new(Magazine::new()) }; MAX_CPUS],
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn reclaim_priority(&self) -> u8 {
        self.reclaim_priority
    }

    fn chunk_pages(&self) -> usize {
        // At least eight objects per chunk keeps grow frequency down.
        (self.object_size * 8).div_ceil(PAGE_SIZE).max(1)
    }

    /// Allocate one object, growing the cache when empty. The constructor,
    /// if any, runs as the object leaves the pool.
    pub fn alloc(&self, flags: HeapFlags) -> KernelResult<NonNull<u8>> {
        let obj = self.alloc_raw(flags)?;
        if let Some(ctor) = self.ctor {
            ctor(obj.as_ptr());
        }
        Ok(obj)
    }

    fn alloc_raw(&self, flags: HeapFlags) -> KernelResult<NonNull<u8>> {
        // Magazine fast path.
        {
            let mut mag = self.magazines[crate::arch::cpu_id()].lock();
            if mag.count > 0 {
                mag.count -= 1;
                let p = mag.slots[mag.count];
                // SAFETY: pointers in the magazine came from this cache.
                return Ok(unsafe { NonNull::new_unchecked(p) });
            }
        }

        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(head) = inner.free_list {
                    // SAFETY: free-list nodes live inside chunk memory owned
                    // by this cache.
                    inner.free_list = unsafe { head.as_ref().next };
                    inner.free_objects -= 1;
                    return Ok(head.cast());
                }
            }
            match self.grow() {
                Ok(()) => continue,
                Err(e) => {
                    if flags.contains(HeapFlags::FATAL) {
                        panic!("fatal allocation from cache {} failed", self.name);
                    }
                    if flags.contains(HeapFlags::SLEEP) {
                        // Give reclaim a chance and retry once more.
                        crate::sched::yield_now();
                        if self.grow().is_ok() {
                            continue;
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Return an object to the cache. The destructor, if any, runs as the
    /// object re-enters the pool.
    pub fn free(&self, obj: NonNull<u8>) {
        if let Some(dtor) = self.dtor {
            dtor(obj.as_ptr());
        }
        let mut mag = self.magazines[crate::arch::cpu_id()].lock();
        if mag.count < MAGAZINE_SIZE {
            let idx = mag.count;
            mag.slots[idx] = obj.as_ptr();
            mag.count += 1;
            return;
        }
        drop(mag);
        self.free_to_inner(obj);
    }

    fn free_to_inner(&self, obj: NonNull<u8>) {
        let mut inner = self.inner.lock();
        let node: NonNull<FreeObject> = obj.cast();
        // SAFETY: the object belongs to this cache and is dead; reusing its
        // first word as the free-list link is the slab invariant.
        unsafe {
            node.as_ptr().write(FreeObject {
                next: inner.free_list,
            });
        }
        inner.free_list = Some(node);
        inner.free_objects += 1;
    }

    /// Flush this CPU's magazine back to the shared pool. Reclaim path.
    pub fn shrink(&self) {
        let mut mag = self.magazines[crate::arch::cpu_id()].lock();
        while mag.count > 0 {
            mag.count -= 1;
            let p = mag.slots[mag.count];
            // SAFETY: magazine pointers came from this cache.
            self.free_to_inner(unsafe { NonNull::new_unchecked(p) });
        }
    }

    /// Back a fresh chunk and carve it into objects.
    fn grow(&self) -> KernelResult<()> {
        let pages = self.chunk_pages();
        let base = chunk_alloc(pages)?;
        let object_count = pages * PAGE_SIZE / self.object_size;

        let mut inner = self.inner.lock();
        for i in 0..object_count {
            let obj = (base.as_usize() + i * self.object_size) as *mut u8;
            // SAFETY: `obj` points into the fresh chunk; carving it into the
            // free list is the only access.
            unsafe {
                (obj as *mut FreeObject).write(FreeObject {
                    next: inner.free_list,
                });
                inner.free_list = Some(NonNull::new_unchecked(obj as *mut FreeObject));
            }
        }
        inner.free_objects += object_count;
        inner.total_objects += object_count;
        inner.chunk_count += 1;
        Ok(())
    }

    /// (total, free) object counts, for diagnostics.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.total_objects, inner.free_objects)
    }
}

/// Reserve `pages` of heap range and back them with frames.
fn chunk_alloc(pages: usize) -> KernelResult<VirtAddr> {
    #[cfg(target_os = "none")]
    {
        let base = KERNEL_RANGE.lock().alloc(pages * PAGE_SIZE)?;
        for i in 0..pages {
            let frame = super::phys::page_alloc(1, PageAllocFlags::empty())?;
            let vaddr = base.offset((i * PAGE_SIZE) as u64);
            super::vas::kernel_space().map_insert(vaddr, frame, Protection::RW);
        }
        Ok(base)
    }
    #[cfg(not(target_os = "none"))]
    {
        extern crate std;
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
            .expect("page-multiple layout is always valid");
        // SAFETY: layout is non-zero.
        let p = unsafe { std::alloc::alloc(layout) };
        NonNull::new(p)
            .map(|p| VirtAddr::new(p.as_ptr() as u64))
            .ok_or(KernelError::OutOfMemory)
    }
}

/// Release `pages` of heap range and their frames.
#[cfg(target_os = "none")]
fn chunk_free(base: VirtAddr, pages: usize) {
    for i in 0..pages {
        let vaddr = base.offset((i * PAGE_SIZE) as u64);
        if let Ok(frame) = super::vas::kernel_space().map_remove(vaddr) {
            super::phys::page_free(frame, 1);
        }
    }
    KERNEL_RANGE.lock().free(base, pages * PAGE_SIZE);
}

#[cfg(not(target_os = "none"))]
fn chunk_free(base: VirtAddr, pages: usize) {
    extern crate std;
    let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
        .expect("page-multiple layout is always valid");
    // SAFETY: `base` came from `chunk_alloc` with the same layout.
    unsafe { std::alloc::dealloc(base.as_mut_ptr(), layout) };
}

// ---------------------------------------------------------------------------
// kmalloc caches
// ---------------------------------------------------------------------------

static KMALLOC_CACHES: [SlabCache; SIZE_CLASSES.len()] = [
    SlabCache::new("kmalloc-16", 16, None, None, 0),
    SlabCache::new("kmalloc-32", 32, None, None, 0),
    SlabCache::new("kmalloc-64", 64, None, None, 0),
    SlabCache::new("kmalloc-128", 128, None, None, 0),
    SlabCache::new("kmalloc-256", 256, None, None, 0),
    SlabCache::new("kmalloc-512", 512, None, None, 0),
    SlabCache::new("kmalloc-1024", 1024, None, None, 0),
    SlabCache::new("kmalloc-2048", 2048, None, None, 0),
    SlabCache::new("kmalloc-4096", 4096, None, None, 0),
];

fn class_for(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&c| size <= c)
}

/// General-purpose kernel allocation. Zero-sized requests are a programmer
/// error and panic.
pub fn kmalloc(size: usize, flags: HeapFlags) -> KernelResult<NonNull<u8>> {
    assert!(size > 0, "zero-sized kmalloc");
    let total = size + HEADER_SIZE;

    let (raw, header) = match class_for(total) {
        Some(class) => {
            let obj = KMALLOC_CACHES[class].alloc(flags)?;
            (
                obj,
                AllocHeader {
                    class,
                    pages: 0,
                },
            )
        }
        None => {
            let pages = total.div_ceil(PAGE_SIZE);
            let base = match chunk_alloc(pages) {
                Ok(base) => base,
                Err(e) if flags.contains(HeapFlags::FATAL) => {
                    panic!("fatal kmalloc of {} bytes failed: {}", size, e)
                }
                Err(e) => return Err(e),
            };
            (
                // SAFETY: chunk_alloc never returns a null range.
                unsafe { NonNull::new_unchecked(base.as_mut_ptr()) },
                AllocHeader {
                    class: usize::MAX,
                    pages,
                },
            )
        }
    };

    // SAFETY: the allocation is at least HEADER_SIZE + size bytes and the
    // base is 16-byte aligned for every class and for whole pages.
    unsafe {
        raw.cast::<AllocHeader>().as_ptr().write(header);
        Ok(NonNull::new_unchecked(raw.as_ptr().add(HEADER_SIZE)))
    }
}

/// Free a pointer returned by [`kmalloc`].
pub fn kfree(ptr: NonNull<u8>) {
    // SAFETY: kmalloc placed the header immediately before the pointer.
    let (raw, header) = unsafe {
        let raw = NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE));
        let header = raw.cast::<AllocHeader>().as_ptr().read();
        (raw, header)
    };
    if header.class == usize::MAX {
        chunk_free(VirtAddr::new(raw.as_ptr() as u64), header.pages);
    } else {
        KMALLOC_CACHES[header.class].free(raw);
    }
}

// ---------------------------------------------------------------------------
// Rust global allocator
// ---------------------------------------------------------------------------

/// Bootstrap heap serving allocations made before [`init`].
#[cfg(target_os = "none")]
static BOOT_HEAP: LockedHeap = LockedHeap::empty();

#[cfg(target_os = "none")]
static mut BOOT_HEAP_MEMORY: [u8; BOOT_HEAP_SIZE] = [0; BOOT_HEAP_SIZE];

/// Global allocator dispatching to the kmalloc caches once they are online.
pub struct KernelAllocator;

#[cfg(target_os = "none")]
#[global_allocator]
static GLOBAL: KernelAllocator = KernelAllocator;

// SAFETY: alloc/dealloc pair classes by layout, so every deallocation goes
// back to the pool it came from; the bootstrap heap is range-checked.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !ONLINE.load(Ordering::Acquire) {
            #[cfg(target_os = "none")]
            // SAFETY: forwarding to the bootstrap linked-list heap.
            return unsafe { BOOT_HEAP.alloc(layout) };
        }
        let size = layout.size().max(layout.align());
        match class_for(size) {
            Some(class) => KMALLOC_CACHES[class]
                .alloc(HeapFlags::empty())
                .map(|p| p.as_ptr())
                .unwrap_or(ptr::null_mut()),
            None => chunk_alloc(size.div_ceil(PAGE_SIZE))
                .map(|v| v.as_mut_ptr())
                .unwrap_or(ptr::null_mut()),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        #[cfg(target_os = "none")]
        {
            // SAFETY: only the address of the bootstrap array is taken.
            let base = unsafe { core::ptr::addr_of!(BOOT_HEAP_MEMORY) as usize };
            let addr = ptr as usize;
            if addr >= base && addr < base + BOOT_HEAP_SIZE {
                // SAFETY: the pointer came from the bootstrap heap.
                unsafe { BOOT_HEAP.dealloc(ptr, layout) };
                return;
            }
        }
        let size = layout.size().max(layout.align());
        let Some(obj) = NonNull::new(ptr) else { return };
        match class_for(size) {
            Some(class) => KMALLOC_CACHES[class].free(obj),
            None => chunk_free(VirtAddr::new(ptr as u64), size.div_ceil(PAGE_SIZE)),
        }
    }
}

/// Seed the bootstrap heap. Must run before anything allocates; repeated
/// calls are ignored.
pub fn init_bootstrap() {
    #[cfg(target_os = "none")]
    {
        static SEEDED: AtomicBool = AtomicBool::new(false);
        if SEEDED.swap(true, Ordering::AcqRel) {
            return;
        }
        // SAFETY: BOOT_HEAP_MEMORY is only handed to the bootstrap heap,
        // exactly once.
        unsafe {
            BOOT_HEAP
                .lock()
                .init(core::ptr::addr_of_mut!(BOOT_HEAP_MEMORY) as *mut u8, BOOT_HEAP_SIZE);
        }
    }
}

/// Reclaim pass: flush per-CPU magazines back to the shared pools,
/// highest reclaim priority first. Run by the background memory thread
/// when the free-page pool runs low.
pub fn reclaim() {
    let mut order: [usize; SIZE_CLASSES.len()] = core::array::from_fn(|i| i);
    order.sort_unstable_by_key(|&i| core::cmp::Reverse(KMALLOC_CACHES[i].reclaim_priority()));
    for i in order {
        KMALLOC_CACHES[i].shrink();
    }
}

/// Bring the slab layer online: seed the heap range and switch the global
/// allocator away from the bootstrap heap.
pub fn init() {
    KERNEL_RANGE
        .lock()
        .init(config::KERNEL_HEAP_BASE, config::KERNEL_HEAP_SIZE);
    ONLINE.store(true, Ordering::Release);
    log::info!(
        "kernel heap online: {} size classes over {} MiB of range",
        SIZE_CLASSES.len(),
        config::KERNEL_HEAP_SIZE / (1024 * 1024)
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn size_class_selection() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(16), Some(0));
        assert_eq!(class_for(17), Some(1));
        assert_eq!(class_for(4096), Some(SIZE_CLASSES.len() - 1));
        assert_eq!(class_for(4097), None);
    }

    #[test]
    fn cache_alloc_free_reuses_objects() {
        static CACHE: SlabCache = SlabCache::new("test-64", 64, None, None, 0);
        let a = CACHE.alloc(HeapFlags::empty()).expect("first object");
        CACHE.free(a);
        let b = CACHE.alloc(HeapFlags::empty()).expect("second object");
        // Magazine LIFO hands the same object straight back.
        assert_eq!(a, b);
        CACHE.free(b);
    }

    #[test]
    fn cache_serves_many_objects() {
        static CACHE: SlabCache = SlabCache::new("test-128", 128, None, None, 0);
        let mut held = alloc::vec::Vec::new();
        for _ in 0..200 {
            held.push(CACHE.alloc(HeapFlags::empty()).expect("object"));
        }
        // All distinct.
        for (i, a) in held.iter().enumerate() {
            for b in held.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        let (total, free) = CACHE.stats();
        assert!(total >= 200);
        for p in held {
            CACHE.free(p);
        }
        let (_, free_after) = CACHE.stats();
        let _ = (free, free_after);
    }

    #[test]
    fn ctor_runs_on_carve() {
        fn ctor(p: *mut u8) {
            // SAFETY: called on a fresh, writable object.
            unsafe { p.write(0xAB) };
        }
        static CACHE: SlabCache = SlabCache::new("test-ctor", 32, Some(ctor), None, 0);
        let obj = CACHE.alloc(HeapFlags::empty()).expect("object");
        // SAFETY: obj is a live allocation from the cache.
        assert_eq!(unsafe { obj.as_ptr().read() }, 0xAB);
        CACHE.free(obj);
    }

    #[test]
    fn kmalloc_round_trip() {
        let p = kmalloc(100, HeapFlags::empty()).expect("small allocation");
        // SAFETY: p is a live 100-byte allocation.
        unsafe {
            p.as_ptr().write_bytes(0x5A, 100);
            assert_eq!(p.as_ptr().add(99).read(), 0x5A);
        }
        kfree(p);

        let big = kmalloc(64 * 1024, HeapFlags::empty()).expect("page-backed allocation");
        // SAFETY: big is a live 64 KiB allocation.
        unsafe { big.as_ptr().write_bytes(0x11, 64 * 1024) };
        kfree(big);
    }

    #[test]
    #[should_panic(expected = "zero-sized kmalloc")]
    fn zero_sized_kmalloc_panics() {
        let _ = kmalloc(0, HeapFlags::empty());
    }
}
