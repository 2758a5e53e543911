//! IPC end-to-end: an echo server thread and a client exchanging messages
//! over a port, plus hangup semantics with real scheduling.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[path = "common/mod.rs"]
mod common;

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
mod kernel_test {
    extern crate alloc;

    use core::sync::atomic::{AtomicU32, Ordering};

    use bootloader_api::{entry_point, BootInfo};
    use cinder_kernel::{
        config::PRIORITY_KERNEL,
        error::KernelError,
        ipc::{port, ConnectionEnd, Message, Port},
        object::Handle,
        sched::{self, thread},
        serial_println,
        sync::FOREVER,
        test_framework::{exit_qemu, QemuExitCode},
    };

    entry_point!(kmain, config = &super::common::BOOTLOADER_CONFIG);

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        cinder_kernel::test_panic_handler(info)
    }

    static PORT_ID: AtomicU32 = AtomicU32::new(0);

    /// Echo server: accept one connection, bounce messages back with the
    /// tag incremented, stop on hangup.
    fn server_main(_arg: usize) {
        let port_handle = {
            let (handle, id) = port::create().expect("port create");
            PORT_ID.store(id, Ordering::Release);
            handle
        };
        let port = port_handle.downcast::<Port>().expect("port object");
        let server = port::listen(&port, FOREVER).expect("accept");
        let end = server.downcast::<ConnectionEnd>().expect("endpoint");
        loop {
            match end.receive(FOREVER, false) {
                Ok(msg) => {
                    let reply = Message::new(msg.tag() + 1, msg.into_data()).expect("reply");
                    if end.send(reply, FOREVER).is_err() {
                        break;
                    }
                }
                Err(KernelError::DestUnreachable) => break,
                Err(e) => panic!("server receive failed: {}", e),
            }
        }
    }

    fn client_end() -> (alloc::sync::Arc<Handle>, alloc::sync::Arc<ConnectionEnd>) {
        // Wait for the server to publish its port id.
        let id = loop {
            match PORT_ID.load(Ordering::Acquire) {
                0 => sched::yield_now(),
                id => break id,
            }
        };
        let handle = port::open(id, FOREVER).expect("connect");
        let end = handle.downcast::<ConnectionEnd>().expect("endpoint");
        (handle, end)
    }

    fn kmain(boot_info: &'static mut BootInfo) -> ! {
        super::common::init_test_env("ipc echo tests", boot_info);

        let server = thread::spawn("echo-server", PRIORITY_KERNEL, true, server_main, 0)
            .expect("server thread");
        sched::run(&server, None);

        let (handle, end) = client_end();

        serial_println!("echo_round_trip...");
        end.send(Message::new(1, b"hello".to_vec()).expect("msg"), FOREVER)
            .expect("send");
        let reply = end.receive(FOREVER, false).expect("reply");
        assert_eq!(reply.tag(), 2);
        assert_eq!(reply.data(), b"hello");
        serial_println!("[ok]");

        serial_println!("ordered_stream...");
        for i in 0..32u32 {
            end.send(Message::new(i, alloc::vec![i as u8; 8]).expect("msg"), FOREVER)
                .expect("send");
        }
        for i in 0..32u32 {
            let reply = end.receive(FOREVER, false).expect("reply");
            assert_eq!(reply.tag(), i + 1, "replies must arrive in send order");
        }
        serial_println!("[ok]");

        serial_println!("hangup_surfaces...");
        drop(end);
        drop(handle);
        // The server sees the hangup and exits; give it a moment.
        sched::sleep_us(10_000);
        serial_println!("[ok]");

        serial_println!("all tests passed");
        exit_qemu(QemuExitCode::Success)
    }
}
