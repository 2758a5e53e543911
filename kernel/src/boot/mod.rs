//! Bootloader handoff.
//!
//! The bootloader hands over a single kernel-args structure: the physical
//! memory map, loaded module images, framebuffer geometry, the boot CPU,
//! the boot filesystem UUID, and feature toggles. Everything the core needs
//! from the boot environment flows through this type; the raw
//! `bootloader_api` structures never escape this module.

use alloc::vec::Vec;

use crate::mm::PhysAddr;

/// Classification of one physical range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeType {
    /// Usable RAM, owned by the page allocator.
    Free,
    /// In use by the kernel image or boot data; never reclaimed.
    Allocated,
    /// Bootloader data the kernel may reclaim once it has consumed it.
    Reclaimable,
    /// Firmware-reserved; never touched.
    Reserved,
    /// Kernel-internal (page tables built by the bootloader).
    Internal,
}

/// One physical memory range, end exclusive.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
    pub kind: RangeType,
}

/// A module image loaded by the bootloader (kernel module or boot archive).
#[derive(Debug, Clone, Copy)]
pub struct BootModule {
    pub base: PhysAddr,
    pub size: u64,
}

/// Framebuffer geometry as configured by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub phys: PhysAddr,
}

/// Everything the bootloader hands the kernel.
pub struct KernelArgs {
    memory_ranges: Vec<MemoryRange>,
    modules: Vec<BootModule>,
    pub framebuffer: Option<Framebuffer>,
    pub boot_cpu: u32,
    pub bootfs_uuid: [u8; 16],
    pub smp_enabled: bool,
    pub splash_enabled: bool,
    /// Kernel text range for the late read-only pass, when known.
    pub kernel_text: Option<(u64, u64)>,
    /// Kernel data range for the late no-execute pass, when known.
    pub kernel_data: Option<(u64, u64)>,
    /// Early identity mapping to drop after late init, when one was made.
    pub identity_map: Option<(u64, u64)>,
}

impl KernelArgs {
    pub fn memory_ranges(&self) -> &[MemoryRange] {
        &self.memory_ranges
    }

    pub fn modules(&self) -> &[BootModule] {
        &self.modules
    }

    /// Total bytes of free RAM in the map.
    pub fn free_bytes(&self) -> u64 {
        self.memory_ranges
            .iter()
            .filter(|r| r.kind == RangeType::Free)
            .map(|r| r.end - r.start)
            .sum()
    }

    /// Hand-built args for tests and early bring-up.
    pub fn synthetic(memory_ranges: Vec<MemoryRange>) -> Self {
        Self {
            memory_ranges,
            modules: Vec::new(),
            framebuffer: None,
            boot_cpu: 0,
            bootfs_uuid: [0; 16],
            smp_enabled: false,
            splash_enabled: false,
            kernel_text: None,
            kernel_data: None,
            identity_map: None,
        }
    }
}

/// Translate the bootloader's view of the machine into kernel args.
#[cfg(target_os = "none")]
pub fn from_boot_info(info: &bootloader_api::BootInfo) -> KernelArgs {
    use bootloader_api::info::MemoryRegionKind;

    let mut ranges = Vec::new();
    for region in info.memory_regions.iter() {
        let kind = match region.kind {
            MemoryRegionKind::Usable => RangeType::Free,
            MemoryRegionKind::Bootloader => RangeType::Reclaimable,
            MemoryRegionKind::UnknownBios(_) | MemoryRegionKind::UnknownUefi(_) => {
                RangeType::Reserved
            }
            _ => RangeType::Reserved,
        };
        ranges.push(MemoryRange {
            start: region.start,
            end: region.end,
            kind,
        });
    }

    let framebuffer = info.framebuffer.as_ref().into_option().map(|fb| {
        let fbinfo = fb.info();
        Framebuffer {
            width: fbinfo.width as u32,
            height: fbinfo.height as u32,
            depth: (fbinfo.bytes_per_pixel * 8) as u32,
            // The bootloader hands the buffer by virtual address; the core
            // records where it sits and leaves drawing to drivers.
            phys: PhysAddr::new(fb.buffer().as_ptr() as u64),
        }
    });

    KernelArgs {
        memory_ranges: ranges,
        modules: Vec::new(),
        framebuffer,
        boot_cpu: 0,
        bootfs_uuid: [0; 16],
        smp_enabled: true,
        splash_enabled: false,
        kernel_text: None,
        kernel_data: None,
        identity_map: None,
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn free_bytes_counts_only_free_ranges() {
        let args = KernelArgs::synthetic(vec![
            MemoryRange {
                start: 0x10_0000,
                end: 0x20_0000,
                kind: RangeType::Reserved,
            },
            MemoryRange {
                start: 0x20_0000,
                end: 0x420_0000,
                kind: RangeType::Free,
            },
        ]);
        assert_eq!(args.free_bytes(), 0x400_0000);
        assert_eq!(args.memory_ranges().len(), 2);
    }
}
