//! Physical page allocator.
//!
//! Buddy allocator with one free list per power-of-two order and coalescing
//! on free. Per-frame metadata is carved out of the managed region itself at
//! init, so the allocator never touches the kernel heap and can safely be
//! called while page tables are being built.
//!
//! Free frames remember whether their contents are zero. `ZERO` requests
//! prefer such frames and zero the rest inline; a low-priority kernel thread
//! refills the zeroed pool in the background (see [`zero_pending`]).

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    boot::{KernelArgs, RangeType},
    config::PAGE_SIZE,
    error::{KernelError, KernelResult},
    mm::{PageAllocFlags, PhysAddr},
    sync::SpinLock,
};

/// Largest supported allocation order: 2^18 pages = 1 GiB, the biggest page
/// table entry size on x86-64.
pub const MAX_ORDER: usize = 18;

/// Maximum number of distinct physical memory regions.
const MAX_REGIONS: usize = 16;

/// List terminator for the index-linked free lists.
const NIL: u32 = u32::MAX;

const FRAME_FREE: u8 = 1 << 0;
const FRAME_ZEROED: u8 = 1 << 1;

/// Below this many pre-zeroed free frames the background zeroer has work.
const ZERO_LOW_WATERMARK: u64 = 64;

/// Per-frame bookkeeping. Free frames are linked into their order's list
/// through `next`/`prev`; allocated frames record the order of their run in
/// the head frame.
#[derive(Clone, Copy)]
struct FrameInfo {
    next: u32,
    prev: u32,
    order: u8,
    flags: u8,
}

impl FrameInfo {
    const fn unused() -> Self {
        Self {
            next: NIL,
            prev: NIL,
            order: 0,
            flags: 0,
        }
    }

    fn is_free(&self) -> bool {
        self.flags & FRAME_FREE != 0
    }

    fn is_zeroed(&self) -> bool {
        self.flags & FRAME_ZEROED != 0
    }
}

/// One contiguous managed region with its buddy free lists.
pub struct BuddyRegion {
    base: PhysAddr,
    frame_count: usize,
    frames: &'static mut [FrameInfo],
    free_heads: [u32; MAX_ORDER + 1],
    free_frames: u64,
    zeroed_frames: u64,
}

impl BuddyRegion {
    /// Build a region over `frame_count` frames starting at `base`, using
    /// caller-provided metadata storage. Every frame starts allocated; the
    /// constructor frees them order-by-order to seed the lists.
    fn new(base: PhysAddr, frame_count: usize, frames: &'static mut [FrameInfo]) -> Self {
        assert!(base.is_page_aligned());
        assert!(frames.len() >= frame_count);
        for f in frames.iter_mut() {
            *f = FrameInfo::unused();
        }
        let mut region = Self {
            base,
            frame_count,
            frames,
            free_heads: [NIL; MAX_ORDER + 1],
            free_frames: 0,
            zeroed_frames: 0,
        };
        // Seed: release the whole range in maximal naturally-aligned runs.
        let mut idx = 0usize;
        while idx < frame_count {
            let mut order = (idx.trailing_zeros() as usize).min(MAX_ORDER);
            while idx + (1 << order) > frame_count {
                order -= 1;
            }
            region.free_block(idx as u32, order);
            idx += 1 << order;
        }
        region
    }

    fn addr_of(&self, idx: u32) -> PhysAddr {
        self.base.offset(idx as u64 * PAGE_SIZE as u64)
    }

    fn index_of(&self, addr: PhysAddr) -> Option<u32> {
        let base = self.base.as_u64();
        let off = addr.as_u64().checked_sub(base)?;
        let idx = off / PAGE_SIZE as u64;
        if idx < self.frame_count as u64 {
            Some(idx as u32)
        } else {
            None
        }
    }

    fn push(&mut self, idx: u32, order: usize) {
        let head = self.free_heads[order];
        self.frames[idx as usize].next = head;
        self.frames[idx as usize].prev = NIL;
        self.frames[idx as usize].order = order as u8;
        // Every frame of the block carries FREE so stray frees of interior
        // frames are caught; only the head is linked.
        for i in 0..(1usize << order) {
            self.frames[idx as usize + i].flags |= FRAME_FREE;
        }
        if head != NIL {
            self.frames[head as usize].prev = idx;
        }
        self.free_heads[order] = idx;
    }

    fn unlink(&mut self, idx: u32, order: usize) {
        let FrameInfo { next, prev, .. } = self.frames[idx as usize];
        if prev != NIL {
            self.frames[prev as usize].next = next;
        } else {
            self.free_heads[order] = next;
        }
        if next != NIL {
            self.frames[next as usize].prev = prev;
        }
        self.frames[idx as usize].next = NIL;
        self.frames[idx as usize].prev = NIL;
        for i in 0..(1usize << order) {
            self.frames[idx as usize + i].flags &= !FRAME_FREE;
        }
    }

    /// Allocate a block of `1 << order` frames, splitting larger blocks as
    /// needed. Returns the index of the first frame.
    fn alloc_block(&mut self, order: usize) -> Option<u32> {
        let found = (order..=MAX_ORDER).find(|&o| self.free_heads[o] != NIL)?;
        let idx = self.free_heads[found];
        self.unlink(idx, found);
        // Split the surplus halves back onto the lower lists.
        let mut current = found;
        while current > order {
            current -= 1;
            self.push(idx + (1 << current), current);
        }
        self.frames[idx as usize].order = order as u8;
        self.free_frames -= 1 << order;
        let zeroed = self.count_zeroed(idx, order);
        self.zeroed_frames -= zeroed;
        Some(idx)
    }

    /// Free the block starting at `idx`, coalescing with its buddy as far
    /// up as possible. Freed frames lose their zeroed flag: their contents
    /// are whatever the previous owner left behind.
    fn free_block(&mut self, idx: u32, order: usize) {
        let mut idx = idx as usize;
        let freed = 1u64 << order;
        let mut order = order;
        for i in 0..(1usize << order) {
            assert!(
                !self.frames[idx + i].is_free(),
                "double free of frame {:#x}",
                self.addr_of((idx + i) as u32).as_u64()
            );
            self.frames[idx + i].flags &= !FRAME_ZEROED;
        }
        while order < MAX_ORDER {
            let buddy = idx ^ (1usize << order);
            if buddy + (1usize << order) > self.frame_count {
                break;
            }
            // Coalescing requires the buddy to be the head of a free block
            // of exactly this order.
            let info = &self.frames[buddy];
            if !info.is_free() || info.order as usize != order || self.free_heads[order] == NIL {
                break;
            }
            if !self.is_block_head(buddy as u32, order) {
                break;
            }
            self.unlink(buddy as u32, order);
            idx = idx.min(buddy);
            order += 1;
        }
        self.push(idx as u32, order);
        self.free_frames += freed;
    }

    /// Is `idx` linked into the order-`order` free list as a block head?
    fn is_block_head(&self, idx: u32, order: usize) -> bool {
        if self.frames[idx as usize].prev != NIL || self.free_heads[order] == idx {
            return true;
        }
        // A head with prev == NIL that is not the list head is not linked.
        false
    }

    fn count_zeroed(&self, idx: u32, order: usize) -> u64 {
        (0..(1usize << order))
            .filter(|i| self.frames[idx as usize + i].is_zeroed())
            .count() as u64
    }

    /// First free frame whose contents are not known-zero, if any.
    fn first_unzeroed_free(&self) -> Option<u32> {
        for order in 0..=MAX_ORDER {
            let mut idx = self.free_heads[order];
            while idx != NIL {
                for i in 0..(1u32 << order) {
                    if !self.frames[(idx + i) as usize].is_zeroed() {
                        return Some(idx + i);
                    }
                }
                idx = self.frames[idx as usize].next;
            }
        }
        None
    }
}

/// Allocator statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageStats {
    pub total_frames: u64,
    pub free_frames: u64,
    pub zeroed_frames: u64,
    pub allocations: u64,
}

struct PageAllocator {
    regions: [Option<BuddyRegion>; MAX_REGIONS],
    total_frames: u64,
}

impl PageAllocator {
    const fn new() -> Self {
        Self {
            regions: [const { None }; MAX_REGIONS],
            total_frames: 0,
        }
    }

    fn add_region(&mut self, region: BuddyRegion) {
        self.total_frames += region.frame_count as u64;
        let slot = self
            .regions
            .iter_mut()
            .find(|r| r.is_none())
            .expect("too many physical memory regions");
        *slot = Some(region);
    }

    fn alloc(&mut self, order: usize) -> Option<(usize, u32)> {
        for (ri, region) in self.regions.iter_mut().enumerate() {
            if let Some(region) = region {
                if let Some(idx) = region.alloc_block(order) {
                    return Some((ri, idx));
                }
            }
        }
        None
    }
}

static ALLOCATOR: SpinLock<PageAllocator> = SpinLock::new(PageAllocator::new());
static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

fn order_for(count: usize) -> KernelResult<usize> {
    assert!(count > 0, "zero-sized page allocation");
    let order = count.next_power_of_two().trailing_zeros() as usize;
    if order > MAX_ORDER {
        return Err(KernelError::OutOfMemory);
    }
    Ok(order)
}

/// Allocate a naturally-aligned run of `count` contiguous frames (rounded up
/// to a power of two). With `ZERO` the returned frames read as zero; with
/// `FATAL` failure panics instead of returning `OutOfMemory`.
pub fn page_alloc(count: usize, flags: PageAllocFlags) -> KernelResult<PhysAddr> {
    let result = page_alloc_inner(count, flags);
    if result.is_err() && flags.contains(PageAllocFlags::FATAL) {
        panic!("fatal allocation of {} pages failed", count);
    }
    result
}

fn page_alloc_inner(count: usize, flags: PageAllocFlags) -> KernelResult<PhysAddr> {
    let order = order_for(count)?;
    let mut allocator = ALLOCATOR.lock();
    let (ri, idx) = allocator.alloc(order).ok_or(KernelError::OutOfMemory)?;
    let region = allocator.regions[ri].as_mut().expect("region vanished");
    let addr = region.addr_of(idx);

    if flags.contains(PageAllocFlags::ZERO) {
        // Zero only the frames the background thread has not reached.
        for i in 0..(1u32 << order) {
            if !region.frames[(idx + i) as usize].is_zeroed() {
                zero_frame(region.addr_of(idx + i));
            }
            region.frames[(idx + i) as usize].flags &= !FRAME_ZEROED;
        }
    }

    ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    Ok(addr)
}

/// Return a run previously obtained from [`page_alloc`]. Double frees are a
/// programmer error and panic.
pub fn page_free(addr: PhysAddr, count: usize) {
    let order = order_for(count).expect("freeing more pages than can be allocated");
    let mut allocator = ALLOCATOR.lock();
    for region in allocator.regions.iter_mut().flatten() {
        if let Some(idx) = region.index_of(addr) {
            region.free_block(idx, order);
            return;
        }
    }
    panic!("page_free of unmanaged address {:#x}", addr.as_u64());
}

/// Zero one free frame that is not yet known-zero. Called in a loop by the
/// background zeroing thread; each call holds the allocator lock only for a
/// single frame. Returns `false` once the zeroed pool is full enough.
pub fn zero_pending() -> bool {
    let mut allocator = ALLOCATOR.lock();
    let mut zeroed_total = 0;
    let mut target: Option<(usize, u32)> = None;
    for (ri, region) in allocator.regions.iter().enumerate() {
        if let Some(region) = region {
            zeroed_total += region.zeroed_frames;
            if target.is_none() {
                if let Some(idx) = region.first_unzeroed_free() {
                    target = Some((ri, idx));
                }
            }
        }
    }
    if zeroed_total >= ZERO_LOW_WATERMARK {
        return false;
    }
    let Some((ri, idx)) = target else {
        return false;
    };
    let region = allocator.regions[ri].as_mut().expect("region vanished");
    zero_frame(region.addr_of(idx));
    region.frames[idx as usize].flags |= FRAME_ZEROED;
    region.zeroed_frames += 1;
    true
}

/// Current allocator statistics.
pub fn stats() -> PageStats {
    let allocator = ALLOCATOR.lock();
    let mut stats = PageStats {
        total_frames: allocator.total_frames,
        allocations: ALLOCATIONS.load(Ordering::Relaxed),
        ..Default::default()
    };
    for region in allocator.regions.iter().flatten() {
        stats.free_frames += region.free_frames;
        stats.zeroed_frames += region.zeroed_frames;
    }
    stats
}

fn zero_frame(addr: PhysAddr) {
    #[cfg(target_os = "none")]
    {
        let ptr: *mut u8 = crate::mm::phys_to_virt(addr).as_mut_ptr();
        // SAFETY: the frame belongs to the allocator (free or just
        // allocated) and the physical window maps all of RAM writable.
        unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE) };
    }
    #[cfg(not(target_os = "none"))]
    let _ = addr;
}

/// Build the allocator from the bootloader memory map. Frame metadata for
/// each free range is carved from the head of the range itself.
pub fn init(args: &KernelArgs) {
    let mut allocator = ALLOCATOR.lock();
    for range in args.memory_ranges() {
        if range.kind != RangeType::Free {
            continue;
        }
        let start = (range.start + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let end = range.end & !(PAGE_SIZE as u64 - 1);
        if end <= start {
            continue;
        }
        let total_frames = ((end - start) / PAGE_SIZE as u64) as usize;
        let meta_bytes = total_frames * core::mem::size_of::<FrameInfo>();
        let meta_frames = meta_bytes.div_ceil(PAGE_SIZE);
        if total_frames <= meta_frames + 1 {
            continue;
        }
        let managed_base = PhysAddr::new(start + (meta_frames * PAGE_SIZE) as u64);
        let managed_frames = total_frames - meta_frames;
        // SAFETY: the metadata area lies inside a FREE range that nothing
        // else uses, reached through the physical window; it is claimed here
        // for the kernel's lifetime.
        let storage = unsafe {
            core::slice::from_raw_parts_mut(
                crate::mm::phys_to_virt(PhysAddr::new(start)).as_mut_ptr::<FrameInfo>(),
                managed_frames,
            )
        };
        allocator.add_region(BuddyRegion::new(managed_base, managed_frames, storage));
        log::info!(
            "frame region {:#x}..{:#x}: {} frames managed",
            managed_base.as_u64(),
            end,
            managed_frames
        );
    }
}

/// Give the host test harness a managed region so allocation paths can be
/// exercised. Frames are bookkeeping-only: nothing dereferences them.
#[cfg(all(test, not(target_os = "none")))]
pub fn seed_for_tests() {
    use core::sync::atomic::AtomicBool;
    static SEEDED: AtomicBool = AtomicBool::new(false);
    if SEEDED.swap(true, Ordering::AcqRel) {
        return;
    }
    let frames = 1024;
    let storage = alloc::vec![FrameInfo::unused(); frames].leak();
    let region = BuddyRegion::new(PhysAddr::new(0x4000_0000), frames, storage);
    ALLOCATOR.lock().add_region(region);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec;

    fn region(frames: usize) -> BuddyRegion {
        let storage = vec![FrameInfo::unused(); frames].leak();
        BuddyRegion::new(PhysAddr::new(0x20_0000), frames, storage)
    }

    #[test]
    fn alloc_free_round_trip() {
        let mut r = region(1024);
        assert_eq!(r.free_frames, 1024);

        let idx = r.alloc_block(0).expect("fresh region must satisfy order 0");
        assert_eq!(r.free_frames, 1023);
        let addr = r.addr_of(idx);
        assert!(addr.is_page_aligned());

        r.free_block(idx, 0);
        assert_eq!(r.free_frames, 1024);
    }

    #[test]
    fn coalescing_restores_maximal_order() {
        let mut r = region(1024);
        let a = r.alloc_block(9).expect("512-frame block");
        let b = r.alloc_block(9).expect("second 512-frame block");
        assert_ne!(a, b);
        assert!(r.alloc_block(9).is_none());

        r.free_block(a, 9);
        r.free_block(b, 9);
        // Both halves must have merged back into one 1024-frame block.
        let whole = r
            .alloc_block(10)
            .expect("full-size block after buddy merge");
        assert_eq!(whole, 0);
    }

    #[test]
    fn split_produces_aligned_buddies() {
        let mut r = region(256);
        let a = r.alloc_block(3).expect("8-frame block");
        assert_eq!(a % 8, 0);
        let b = r.alloc_block(3).expect("second 8-frame block");
        assert_eq!(b % 8, 0);
        r.free_block(a, 3);
        r.free_block(b, 3);
        assert_eq!(r.free_frames, 256);
    }

    #[test]
    fn oversized_request_fails() {
        let mut r = region(64);
        assert!(r.alloc_block(7).is_none());
        assert_eq!(order_for(1 << MAX_ORDER), Ok(MAX_ORDER));
        assert_eq!(
            order_for((1 << MAX_ORDER) + 1),
            Err(KernelError::OutOfMemory)
        );
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut r = region(16);
        let idx = r.alloc_block(0).expect("order 0");
        r.free_block(idx, 0);
        r.free_block(idx, 0);
    }

    #[test]
    fn non_power_of_two_region_is_fully_usable() {
        let mut r = region(1000);
        assert_eq!(r.free_frames, 1000);
        let mut held = vec![];
        while let Some(idx) = r.alloc_block(0) {
            held.push(idx);
        }
        assert_eq!(held.len(), 1000);
        for idx in held {
            r.free_block(idx, 0);
        }
        assert_eq!(r.free_frames, 1000);
    }
}
