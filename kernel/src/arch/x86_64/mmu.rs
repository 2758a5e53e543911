//! x86-64 page-table primitives.
//!
//! Four-level table walk over frames reached through the physical map
//! window. The generic address-space layer owns locking and TLB shootdown;
//! this layer only edits entries and issues local invalidations.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    mm::{self, PageAllocFlags, PhysAddr, Protection, VirtAddr},
};

const ENTRIES: usize = 512;

const FLAG_PRESENT: u64 = 1 << 0;
const FLAG_WRITE: u64 = 1 << 1;
const FLAG_USER: u64 = 1 << 2;
const FLAG_GLOBAL: u64 = 1 << 8;
const FLAG_NX: u64 = 1 << 63;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Set once at boot when CPUID reports execute-disable support; the NX bit
/// is masked out of every entry otherwise.
static NX_SUPPORTED: AtomicBool = AtomicBool::new(false);

/// Probe CPUID for execute-disable support. Boot CPU, before any mapping.
pub fn detect_features() {
    #[cfg(target_os = "none")]
    {
        // SAFETY: CPUID leaf 0x8000_0001 is available on every x86-64 CPU.
        let edx = unsafe { core::arch::x86_64::__cpuid(0x8000_0001).edx };
        NX_SUPPORTED.store(edx & (1 << 20) != 0, Ordering::Relaxed);
    }
}

fn entry_flags(prot: Protection, user: bool, global: bool) -> u64 {
    let mut flags = FLAG_PRESENT;
    if prot.contains(Protection::WRITE) {
        flags |= FLAG_WRITE;
    }
    if !prot.contains(Protection::EXECUTE) && NX_SUPPORTED.load(Ordering::Relaxed) {
        flags |= FLAG_NX;
    }
    if user {
        flags |= FLAG_USER;
    }
    if global {
        flags |= FLAG_GLOBAL;
    }
    flags
}

fn entry_protection(entry: u64) -> Protection {
    let mut prot = Protection::READ;
    if entry & FLAG_WRITE != 0 {
        prot |= Protection::WRITE;
    }
    if entry & FLAG_NX == 0 {
        prot |= Protection::EXECUTE;
    }
    prot
}

fn table_at(phys: PhysAddr) -> *mut u64 {
    mm::phys_to_virt(phys).as_mut_ptr()
}

fn index(virt: VirtAddr, level: usize) -> usize {
    ((virt.as_u64() >> (12 + 9 * level)) & 0x1FF) as usize
}

/// One hardware page map: the PML4 root plus the user flag that decides
/// which entries intermediate levels get.
#[derive(Debug)]
pub struct PageMap {
    root: PhysAddr,
    user: bool,
}

impl PageMap {
    /// Wrap the page map the CPU is currently running on. Used once at boot
    /// to adopt the bootloader-built kernel map.
    pub fn from_active() -> Self {
        #[cfg(target_os = "none")]
        let root = {
            let (frame, _) = x86_64::registers::control::Cr3::read();
            PhysAddr::new(frame.start_address().as_u64())
        };
        #[cfg(not(target_os = "none"))]
        let root = PhysAddr::new(0);
        Self { root, user: false }
    }

    /// Build a fresh user map whose kernel half aliases the shared kernel
    /// map (the upper 256 PML4 entries are copied; they point at the same
    /// lower-level tables).
    pub fn new_user(kernel: &PageMap) -> KernelResult<Self> {
        let root = mm::phys::page_alloc(1, PageAllocFlags::ZERO)?;
        let src = table_at(kernel.root);
        let dst = table_at(root);
        for i in ENTRIES / 2..ENTRIES {
            // SAFETY: both tables are page-aligned frames inside the
            // physical window; the kernel half of the source never changes
            // after boot.
            unsafe { dst.add(i).write(src.add(i).read()) };
        }
        Ok(Self { root, user: true })
    }

    /// Physical address of the root table, suitable for CR3.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Walk to the leaf entry for `virt`, allocating intermediate tables
    /// when `create` is set.
    fn walk(&self, virt: VirtAddr, create: bool) -> KernelResult<*mut u64> {
        let mut table = self.root;
        for level in (1..4).rev() {
            let slot = table_at(table).wrapping_add(index(virt, level));
            // SAFETY: `slot` points into a live page-table frame reached
            // through the physical window.
            let entry = unsafe { slot.read() };
            if entry & FLAG_PRESENT == 0 {
                if !create {
                    return Err(KernelError::NotFound);
                }
                let frame = mm::phys::page_alloc(1, PageAllocFlags::ZERO)?;
                let mut flags = FLAG_PRESENT | FLAG_WRITE;
                if self.user {
                    flags |= FLAG_USER;
                }
                // SAFETY: as above; the new frame is zeroed so its entries
                // are all non-present.
                unsafe { slot.write(frame.as_u64() | flags) };
                table = frame;
            } else {
                table = PhysAddr::new(entry & ADDR_MASK);
            }
        }
        Ok(table_at(table).wrapping_add(index(virt, 0)))
    }

    /// Install a 4 KiB mapping. Fails with `AlreadyExists` when the slot is
    /// occupied; the caller treats that as fatal.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        prot: Protection,
        global: bool,
    ) -> KernelResult<()> {
        let slot = self.walk(virt, true)?;
        // SAFETY: `slot` is a leaf entry in this map, owned by the caller's
        // address-space lock.
        unsafe {
            if slot.read() & FLAG_PRESENT != 0 {
                return Err(KernelError::AlreadyExists);
            }
            slot.write(phys.as_u64() | entry_flags(prot, self.user, global));
        }
        Ok(())
    }

    /// Clear the mapping at `virt`, returning the frame it pointed at. The
    /// caller is responsible for TLB invalidation.
    pub fn unmap(&mut self, virt: VirtAddr) -> KernelResult<PhysAddr> {
        let slot = self.walk(virt, false)?;
        // SAFETY: as in `map`.
        unsafe {
            let entry = slot.read();
            if entry & FLAG_PRESENT == 0 {
                return Err(KernelError::NotFound);
            }
            slot.write(0);
            Ok(PhysAddr::new(entry & ADDR_MASK))
        }
    }

    /// Read-only query of the mapping at `virt`.
    pub fn query(&self, virt: VirtAddr) -> Option<(PhysAddr, Protection)> {
        let slot = self.walk(virt, false).ok()?;
        // SAFETY: as in `map`.
        let entry = unsafe { slot.read() };
        if entry & FLAG_PRESENT == 0 {
            return None;
        }
        Some((PhysAddr::new(entry & ADDR_MASK), entry_protection(entry)))
    }

    /// Rewrite the protection bits of an existing mapping. Returns `false`
    /// when `virt` is unmapped (callers iterating a range skip silently).
    pub fn protect(&mut self, virt: VirtAddr, prot: Protection) -> bool {
        let Ok(slot) = self.walk(virt, false) else {
            return false;
        };
        // SAFETY: as in `map`.
        unsafe {
            let entry = slot.read();
            if entry & FLAG_PRESENT == 0 {
                return false;
            }
            let keep = entry & (ADDR_MASK | FLAG_USER | FLAG_GLOBAL | FLAG_PRESENT);
            slot.write(keep | entry_flags(prot, false, false) & !(FLAG_PRESENT | FLAG_USER));
        }
        true
    }

    /// Load this map on the executing CPU.
    pub fn make_current(&self) {
        #[cfg(target_os = "none")]
        {
            use x86_64::{registers::control::Cr3, structures::paging::PhysFrame};
            let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(self.root.as_u64()));
            // SAFETY: the root frame holds a valid PML4 whose kernel half
            // mirrors the shared kernel map.
            unsafe { Cr3::write(frame, Cr3::read().1) };
        }
    }

    /// Free the user-half intermediate tables and the root. Leaf frames are
    /// owned by the mapping layer above and are not touched here.
    fn free_user_tables(&mut self) {
        fn free_level(table: PhysAddr, level: usize, upto: usize) {
            let base = table_at(table);
            for i in 0..upto {
                // SAFETY: walking frames this map exclusively owns.
                let entry = unsafe { base.add(i).read() };
                if entry & FLAG_PRESENT != 0 && level > 1 {
                    free_level(PhysAddr::new(entry & ADDR_MASK), level - 1, ENTRIES);
                }
                if entry & FLAG_PRESENT != 0 {
                    mm::phys::page_free(PhysAddr::new(entry & ADDR_MASK), 1);
                }
            }
        }
        if self.user {
            free_level(self.root, 3, ENTRIES / 2);
            mm::phys::page_free(self.root, 1);
        }
    }
}

impl Drop for PageMap {
    fn drop(&mut self) {
        self.free_user_tables();
    }
}

/// Invalidate the local TLB entry covering `virt`.
#[inline]
pub fn invalidate_page(virt: VirtAddr) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Flush the entire local TLB (non-global entries).
#[inline]
pub fn flush_all() {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush_all();
}
