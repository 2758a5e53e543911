//! Memory subsystem integration tests: allocator round trips, zeroed
//! pages, and mapping behaviour, run against real page tables.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[path = "common/mod.rs"]
mod common;

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
mod kernel_test {
    extern crate alloc;

    use bootloader_api::{entry_point, BootInfo};
    use cinder_kernel::{
        config::PAGE_SIZE,
        mm::{self, heap, phys, vas, HeapFlags, PageAllocFlags, Protection, VirtAddr},
        serial_println,
        test_framework::{exit_qemu, QemuExitCode},
    };

    entry_point!(kmain, config = &super::common::BOOTLOADER_CONFIG);

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        cinder_kernel::test_panic_handler(info)
    }

    fn kmain(boot_info: &'static mut BootInfo) -> ! {
        super::common::init_test_env("memory tests", boot_info);

        zeroed_alloc_round_trip();
        kmalloc_round_trip();
        mapping_round_trip();

        serial_println!("all tests passed");
        exit_qemu(QemuExitCode::Success)
    }

    /// A ZERO allocation reads as zero; freeing may hand the frame back.
    fn zeroed_alloc_round_trip() {
        serial_println!("zeroed_alloc_round_trip...");
        let frame = phys::page_alloc(1, PageAllocFlags::ZERO).expect("zeroed frame");
        let bytes: *const u8 = mm::phys_to_virt(frame).as_ptr();
        for i in 0..PAGE_SIZE {
            // SAFETY: the frame is ours and lives in the physical window.
            assert_eq!(unsafe { bytes.add(i).read() }, 0, "byte {} not zero", i);
        }
        phys::page_free(frame, 1);
        let again = phys::page_alloc(1, PageAllocFlags::empty()).expect("realloc");
        phys::page_free(again, 1);
        serial_println!("[ok]");
    }

    fn kmalloc_round_trip() {
        serial_println!("kmalloc_round_trip...");
        let p = heap::kmalloc(300, HeapFlags::empty()).expect("kmalloc");
        // SAFETY: fresh 300-byte allocation.
        unsafe {
            p.as_ptr().write_bytes(0xC3, 300);
            assert_eq!(p.as_ptr().add(299).read(), 0xC3);
        }
        heap::kfree(p);

        let mut v = alloc::vec::Vec::new();
        for i in 0..10_000u32 {
            v.push(i);
        }
        assert_eq!(v.iter().copied().sum::<u32>(), 49_995_000);
        serial_println!("[ok]");
    }

    /// map_insert followed by map_remove restores the prior state.
    fn mapping_round_trip() {
        serial_println!("mapping_round_trip...");
        let kernel = vas::kernel_space();
        let probe = VirtAddr::new(cinder_kernel::config::KERNEL_HEAP_BASE
            + cinder_kernel::config::KERNEL_HEAP_SIZE
            - PAGE_SIZE as u64);
        assert!(kernel.map_lookup(probe).is_none());

        let frame = phys::page_alloc(1, PageAllocFlags::ZERO).expect("frame");
        kernel.map_insert(probe, frame, Protection::RW);

        let (found, prot) = kernel.map_lookup(probe).expect("mapping present");
        assert_eq!(found, frame);
        assert!(prot.contains(Protection::WRITE));

        // The new mapping is usable immediately.
        let p: *mut u64 = probe.as_mut_ptr();
        // SAFETY: probe maps the freshly allocated frame read-write.
        unsafe {
            p.write(0xDEAD_BEEF_CAFE_F00D);
            assert_eq!(p.read(), 0xDEAD_BEEF_CAFE_F00D);
        }

        let removed = kernel.map_remove(probe).expect("remove");
        assert_eq!(removed, frame);
        assert!(kernel.map_lookup(probe).is_none());
        phys::page_free(frame, 1);
        serial_println!("[ok]");
    }
}
