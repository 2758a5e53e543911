//! Memory management: addresses, protections, the physical map window, and
//! the allocator stack (frames, kernel ranges, slab heap, areas).

pub mod area;
pub mod heap;
pub mod phys;
pub mod range;
pub mod user;
pub mod vas;

use bitflags::bitflags;

use crate::config::{PAGE_SIZE, PHYS_MAP_BASE, PHYS_MAP_SIZE};

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn offset(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn as_ptr<T>(&self) -> *const T {
        self.0 as usize as *const T
    }

    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as usize as *mut T
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn offset(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

bitflags! {
    /// Page protection set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    pub const RW: Self = Self::READ.union(Self::WRITE);
    pub const RX: Self = Self::READ.union(Self::EXECUTE);
}

bitflags! {
    /// Flags accepted by [`phys::page_alloc`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAllocFlags: u32 {
        /// Return pre-zeroed frames.
        const ZERO = 1 << 0;
        /// Panic instead of returning `OutOfMemory`.
        const FATAL = 1 << 1;
    }
}

bitflags! {
    /// Flags accepted by [`heap::kmalloc`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u32 {
        /// The caller may block while pages are reclaimed.
        const SLEEP = 1 << 0;
        /// Panic instead of returning `OutOfMemory`.
        const FATAL = 1 << 1;
    }
}

/// Translate a physical address into the direct-map window.
///
/// The window covers all of physical memory, so this never fails; it is the
/// cheap path for short-lived kernel access to arbitrary frames.
#[inline]
pub fn phys_to_virt(paddr: PhysAddr) -> VirtAddr {
    debug_assert!(paddr.as_u64() < PHYS_MAP_SIZE);
    VirtAddr::new(PHYS_MAP_BASE + paddr.as_u64())
}

/// Map `size` bytes of physical memory for kernel access.
///
/// Regions inside the direct-map window (all of RAM and the usual MMIO
/// ranges) need no page-table work at all; the translated address is
/// returned directly.
pub fn phys_map(paddr: PhysAddr, size: usize) -> VirtAddr {
    debug_assert!(paddr.as_u64() + size as u64 <= PHYS_MAP_SIZE);
    phys_to_virt(paddr)
}

/// Release a mapping obtained from [`phys_map`]. A no-op for addresses
/// inside the direct-map window.
pub fn phys_unmap(vaddr: VirtAddr, _size: usize) {
    debug_assert!(vaddr.as_u64() >= PHYS_MAP_BASE);
}

/// Bring up the memory stack: frame allocator from the boot memory map,
/// then the kernel address space (heap chunks map through it), then the
/// slab heap itself.
pub fn init(args: &crate::boot::KernelArgs) {
    phys::init(args);
    vas::init();
    heap::init();
    log::info!(
        "memory online: {} KiB free",
        phys::stats().free_frames * (PAGE_SIZE as u64 / 1024)
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn address_alignment_helpers() {
        assert!(PhysAddr::new(0x2000).is_page_aligned());
        assert!(!PhysAddr::new(0x2001).is_page_aligned());
        assert_eq!(VirtAddr::new(0x1234).align_down(), VirtAddr::new(0x1000));
    }

    #[test]
    fn phys_window_translation_is_linear() {
        let a = phys_to_virt(PhysAddr::new(0x1000));
        let b = phys_to_virt(PhysAddr::new(0x2000));
        assert_eq!(b.as_u64() - a.as_u64(), 0x1000);
    }
}
