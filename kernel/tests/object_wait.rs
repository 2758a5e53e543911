//! Object waiting and kill semantics under real scheduling: timeouts,
//! multi-object waits, and interruption of an indefinite wait.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[path = "common/mod.rs"]
mod common;

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
mod kernel_test {
    extern crate alloc;

    use core::sync::atomic::{AtomicU8, Ordering};

    use bootloader_api::{entry_point, BootInfo};
    use cinder_kernel::{
        config::PRIORITY_DEFAULT,
        error::KernelError,
        ipc::port,
        object::{object_wait, WaitEvent},
        sched::{self, thread, ThreadState},
        serial_println,
        test_framework::{exit_qemu, QemuExitCode},
        timer,
    };

    entry_point!(kmain, config = &super::common::BOOTLOADER_CONFIG);

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        cinder_kernel::test_panic_handler(info)
    }

    /// 0 = not started, 1 = waiting, 2 = interrupted as expected.
    static SLEEPER_PHASE: AtomicU8 = AtomicU8::new(0);

    /// Blocks forever on a port that never sees a connection; must come
    /// back with Interrupted when killed.
    fn sleeper_main(_arg: usize) {
        let (handle, _id) = port::create().expect("port");
        SLEEPER_PHASE.store(1, Ordering::Release);
        match object_wait(&[(handle, WaitEvent::ConnectionPending)], -1) {
            Err(KernelError::Interrupted) => {
                SLEEPER_PHASE.store(2, Ordering::Release);
            }
            other => panic!("indefinite wait ended with {:?}", other),
        }
        thread::exit();
    }

    fn kmain(boot_info: &'static mut BootInfo) -> ! {
        super::common::init_test_env("object wait tests", boot_info);

        serial_println!("timed_wait_expires...");
        let (handle, _id) = port::create().expect("port");
        let start = timer::system_time();
        let result = object_wait(&[(handle.clone(), WaitEvent::ConnectionPending)], 20_000);
        assert_eq!(result, Err(KernelError::TimedOut));
        assert!(timer::system_time() - start >= 20_000, "returned early");
        serial_println!("[ok]");

        serial_println!("wait_fires_on_connection_attempt...");
        let (handle2, id2) = port::create().expect("port");
        let attempt = port::begin_open(id2).expect("attempt");
        let index = object_wait(
            &[
                (handle.clone(), WaitEvent::ConnectionPending),
                (handle2.clone(), WaitEvent::ConnectionPending),
            ],
            0,
        )
        .expect("pending attempt satisfies the wait");
        assert_eq!(index, 1);
        drop(attempt);
        serial_println!("[ok]");

        serial_println!("kill_interrupts_indefinite_wait...");
        let sleeper = thread::spawn("sleeper", PRIORITY_DEFAULT, false, sleeper_main, 0)
            .expect("sleeper thread");
        sched::run(&sleeper, None);
        while SLEEPER_PHASE.load(Ordering::Acquire) != 1 {
            sched::yield_now();
        }
        // Let it actually block inside object_wait.
        sched::sleep_us(5_000);
        thread::kill(&sleeper).expect("kill");
        let deadline = timer::system_time() + 1_000_000;
        while SLEEPER_PHASE.load(Ordering::Acquire) != 2 {
            assert!(timer::system_time() < deadline, "kill never landed");
            sched::yield_now();
        }
        assert_ne!(sleeper.state(), ThreadState::Running);
        serial_println!("[ok]");

        serial_println!("all tests passed");
        exit_qemu(QemuExitCode::Success)
    }
}
