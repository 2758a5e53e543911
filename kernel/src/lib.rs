//! Cinder kernel library.
//!
//! The core of a monolithic SMP kernel for x86-64: physical and virtual
//! memory management, the thread scheduler, the object/handle model, and
//! port-based IPC. Built as a library so the subsystems are host-testable;
//! the `cinder-kernel` binary provides the boot entry.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

extern crate alloc;

// Host target: link std so unit tests run under the standard harness with
// the system allocator.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod config;
pub mod device;
pub mod error;
pub mod ipc;
pub mod mm;
pub mod object;
pub mod process;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod test_framework;
pub mod timer;
pub mod util;

pub use error::{KernelError, KernelResult};
pub use test_framework::{exit_qemu, test_panic_handler, test_runner, QemuExitCode, Testable};

/// Bring the whole core up on the boot CPU. The binary's entry point calls
/// this with the translated boot arguments; test kernels call it from their
/// own `_start`.
pub fn kmain_init(args: &boot::KernelArgs) {
    serial::init();
    log::info!("cinder {} booting", env!("CARGO_PKG_VERSION"));

    mm::heap::init_bootstrap();
    arch::x86_64::init_bsp();
    sched::early_init();
    mm::init(args);
    timer::init();
    sched::init();
    ipc::init();
    mm::vas::late_init(args);

    log::info!(
        "core online: {} MiB free, {} threads",
        mm::phys::stats().free_frames * (config::PAGE_SIZE as u64) / (1024 * 1024),
        sched::thread::live_count()
    );
}
