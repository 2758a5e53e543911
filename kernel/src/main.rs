//! Cinder kernel binary: boot entry and the panic handler.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_entry {
    use bootloader_api::{config::Mapping, entry_point, BootInfo, BootloaderConfig};
    use cinder_kernel::{boot, config, sched};

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut cfg = BootloaderConfig::new_default();
        // The direct physical window every subsystem leans on.
        cfg.mappings.physical_memory = Some(Mapping::FixedAddress(config::PHYS_MAP_BASE));
        cfg
    };

    entry_point!(kmain, config = &BOOTLOADER_CONFIG);

    fn kmain(boot_info: &'static mut BootInfo) -> ! {
        // Translating the boot information already allocates, so the
        // bootstrap heap comes up before anything else.
        cinder_kernel::mm::heap::init_bootstrap();
        let args = boot::from_boot_info(boot_info);
        cinder_kernel::kmain_init(&args);

        // The boot flow becomes this CPU's idle loop; real work now happens
        // on the threads the init path spawned.
        sched::scheduler::become_idle()
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        cinder_kernel::println!("[KERNEL PANIC] {}", info);
        cinder_kernel::arch::halt()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("cinder-kernel only runs on bare metal; use `cargo test` on the host");
}
