//! Shared setup for the bare-metal test kernels.

#![allow(dead_code)]

#[cfg(target_os = "none")]
pub use bare::*;

#[cfg(target_os = "none")]
mod bare {
    use bootloader_api::{config::Mapping, BootInfo, BootloaderConfig};
    use cinder_kernel::{boot, config, serial_println};

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut cfg = BootloaderConfig::new_default();
        cfg.mappings.physical_memory = Some(Mapping::FixedAddress(config::PHYS_MAP_BASE));
        cfg
    };

    /// Bring the kernel core up and announce the test kernel.
    pub fn init_test_env(name: &str, boot_info: &'static mut BootInfo) {
        cinder_kernel::mm::heap::init_bootstrap();
        let args = boot::from_boot_info(boot_info);
        cinder_kernel::kmain_init(&args);
        serial_println!("=== {} ===", name);
    }
}
