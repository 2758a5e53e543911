//! Bare-metal test harness.
//!
//! Integration tests build as their own kernels, run their cases over
//! serial, and exit QEMU through the debug-exit device. Host-side unit
//! tests use the standard harness and never touch this module's exit path.

use core::panic::PanicInfo;

use crate::{serial_print, serial_println};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Anything runnable as a test case.
pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

/// Run every case and exit QEMU with the aggregate result.
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    serial_println!("all tests passed");
    exit_qemu(QemuExitCode::Success)
}

/// Panic handler for test kernels: report and exit with failure.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]");
    serial_println!("{}", info);
    exit_qemu(QemuExitCode::Failed)
}

/// Exit QEMU via the isa-debug-exit device on port 0xf4.
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::port::Port;
        // SAFETY: port 0xf4 is the QEMU debug-exit device; the write
        // terminates the VM.
        unsafe {
            Port::new(0xf4).write(exit_code as u32);
        }
    }
    let _ = exit_code;
    crate::arch::halt()
}
