//! Kernel virtual-range allocator.
//!
//! Best-fit allocator over a page-granular virtual range. It hands out
//! address space only; callers back the pages themselves. Segments live in
//! a fixed node pool linked in address order, so the allocator works before
//! (and underneath) the kernel heap.

use crate::{
    config::PAGE_SIZE,
    error::{KernelError, KernelResult},
    mm::VirtAddr,
};

const MAX_SEGMENTS: usize = 1024;
const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SegmentState {
    Unused,
    Free,
    Allocated,
}

#[derive(Clone, Copy)]
struct Segment {
    base: u64,
    size: u64,
    state: SegmentState,
    next: u32,
    prev: u32,
}

impl Segment {
    const fn empty() -> Self {
        Self {
            base: 0,
            size: 0,
            state: SegmentState::Unused,
            next: NIL,
            prev: NIL,
        }
    }
}

/// Best-fit allocator over `[base, base + size)`.
pub struct RangeAllocator {
    segments: [Segment; MAX_SEGMENTS],
    head: u32,
    free_bytes: u64,
}

impl RangeAllocator {
    /// Empty allocator; unusable until [`init`](Self::init) seeds the range.
    pub const fn new() -> Self {
        Self {
            segments: [Segment::empty(); MAX_SEGMENTS],
            head: NIL,
            free_bytes: 0,
        }
    }

    /// Seed the managed range. `base` and `size` must be page-aligned.
    pub fn init(&mut self, base: u64, size: u64) {
        assert!(base % PAGE_SIZE as u64 == 0 && size % PAGE_SIZE as u64 == 0);
        assert!(self.head == NIL, "range allocator seeded twice");
        self.segments[0] = Segment {
            base,
            size,
            state: SegmentState::Free,
            next: NIL,
            prev: NIL,
        };
        self.head = 0;
        self.free_bytes = size;
    }

    fn grab_node(&mut self) -> KernelResult<u32> {
        self.segments
            .iter()
            .position(|s| s.state == SegmentState::Unused)
            .map(|i| i as u32)
            .ok_or(KernelError::OutOfMemory)
    }

    /// Reserve `size` bytes (rounded up to whole pages). Best fit: the
    /// smallest free segment that satisfies the request is chosen, and split
    /// when larger than needed.
    pub fn alloc(&mut self, size: usize) -> KernelResult<VirtAddr> {
        assert!(size > 0, "zero-sized range allocation");
        let size = (size + PAGE_SIZE - 1) as u64 & !(PAGE_SIZE as u64 - 1);

        let mut best: Option<u32> = None;
        let mut cursor = self.head;
        while cursor != NIL {
            let seg = &self.segments[cursor as usize];
            if seg.state == SegmentState::Free && seg.size >= size {
                let better = match best {
                    Some(b) => seg.size < self.segments[b as usize].size,
                    None => true,
                };
                if better {
                    best = Some(cursor);
                }
            }
            cursor = seg.next;
        }
        let idx = best.ok_or(KernelError::OutOfMemory)?;

        let (seg_base, seg_size, seg_next) = {
            let seg = &self.segments[idx as usize];
            (seg.base, seg.size, seg.next)
        };
        if seg_size > size {
            // Split: keep the tail free.
            let tail = self.grab_node()?;
            self.segments[tail as usize] = Segment {
                base: seg_base + size,
                size: seg_size - size,
                state: SegmentState::Free,
                next: seg_next,
                prev: idx,
            };
            if seg_next != NIL {
                self.segments[seg_next as usize].prev = tail;
            }
            self.segments[idx as usize].next = tail;
            self.segments[idx as usize].size = size;
        }
        self.segments[idx as usize].state = SegmentState::Allocated;
        self.free_bytes -= size;
        Ok(VirtAddr::new(seg_base))
    }

    /// Return a range obtained from [`alloc`](Self::alloc). Adjacent free
    /// segments re-merge so the range never fragments permanently.
    pub fn free(&mut self, addr: VirtAddr, size: usize) {
        let size = (size + PAGE_SIZE - 1) as u64 & !(PAGE_SIZE as u64 - 1);
        let mut cursor = self.head;
        while cursor != NIL {
            let seg = self.segments[cursor as usize];
            if seg.base == addr.as_u64() {
                assert!(
                    seg.state == SegmentState::Allocated,
                    "freeing unallocated range {:#x}",
                    addr.as_u64()
                );
                assert!(seg.size == size, "range size mismatch on free");
                self.segments[cursor as usize].state = SegmentState::Free;
                self.free_bytes += size;
                self.merge_with_next(cursor);
                if seg.prev != NIL
                    && self.segments[seg.prev as usize].state == SegmentState::Free
                {
                    self.merge_with_next(seg.prev);
                }
                return;
            }
            cursor = seg.next;
        }
        panic!("freeing unknown range {:#x}", addr.as_u64());
    }

    fn merge_with_next(&mut self, idx: u32) {
        let next = self.segments[idx as usize].next;
        if next == NIL {
            return;
        }
        if self.segments[idx as usize].state != SegmentState::Free
            || self.segments[next as usize].state != SegmentState::Free
        {
            return;
        }
        let next_seg = self.segments[next as usize];
        self.segments[idx as usize].size += next_seg.size;
        self.segments[idx as usize].next = next_seg.next;
        if next_seg.next != NIL {
            self.segments[next_seg.next as usize].prev = idx;
        }
        self.segments[next as usize] = Segment::empty();
    }

    /// Bytes currently free in the range.
    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }
}

impl Default for RangeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn allocator() -> RangeAllocator {
        let mut r = RangeAllocator::new();
        r.init(0x1000_0000, 1024 * PAGE_SIZE as u64);
        r
    }

    #[test]
    fn alloc_rounds_to_pages() {
        let mut r = allocator();
        let a = r.alloc(1).expect("1-byte request");
        let b = r.alloc(PAGE_SIZE + 1).expect("page+1 request");
        assert_eq!(b.as_u64() - a.as_u64(), PAGE_SIZE as u64);
        assert_eq!(
            r.free_bytes(),
            (1024 - 3) * PAGE_SIZE as u64,
            "1 + 2 pages consumed"
        );
    }

    #[test]
    fn best_fit_prefers_smallest_hole() {
        let mut r = allocator();
        let a = r.alloc(4 * PAGE_SIZE).expect("a");
        let _b = r.alloc(PAGE_SIZE).expect("b");
        let c = r.alloc(2 * PAGE_SIZE).expect("c");
        let _d = r.alloc(PAGE_SIZE).expect("d");
        // Free a 4-page and a 2-page hole; a 2-page request must land in
        // the smaller one (c's old spot).
        r.free(a, 4 * PAGE_SIZE);
        r.free(c, 2 * PAGE_SIZE);
        let e = r.alloc(2 * PAGE_SIZE).expect("e");
        assert_eq!(e, c);
    }

    #[test]
    fn free_remerges_neighbours() {
        let mut r = allocator();
        let a = r.alloc(512 * PAGE_SIZE).expect("first half");
        let b = r.alloc(512 * PAGE_SIZE).expect("second half");
        assert!(r.alloc(PAGE_SIZE).is_err());
        r.free(a, 512 * PAGE_SIZE);
        r.free(b, 512 * PAGE_SIZE);
        let whole = r.alloc(1024 * PAGE_SIZE).expect("full range after merge");
        assert_eq!(whole, a);
    }

    #[test]
    #[should_panic(expected = "freeing unknown range")]
    fn free_of_unknown_range_panics() {
        let mut r = allocator();
        r.free(VirtAddr::new(0xdead_0000), PAGE_SIZE);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut r = allocator();
        let _ = r.alloc(1024 * PAGE_SIZE).expect("whole range");
        assert_eq!(r.alloc(PAGE_SIZE), Err(KernelError::OutOfMemory));
    }
}
