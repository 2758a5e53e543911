//! Serial console and kernel logger.
//!
//! The 16550 UART on COM1 is the kernel's console. The [`log`] facade is
//! wired to it so subsystems log with `log::info!` and friends instead of
//! bare prints. The port is guarded by an interrupt-safe spinlock so the
//! logger stays usable from interrupt context.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Metadata, Record};

use crate::config;

#[cfg(target_os = "none")]
mod port {
    use lazy_static::lazy_static;
    use uart_16550::SerialPort;

    use crate::sync::SpinLock;

    lazy_static! {
        pub static ref COM1: SpinLock<SerialPort> = {
            // SAFETY: 0x3F8 is the standard COM1 I/O port base on PCs; no
            // other kernel code touches these ports.
            let mut port = unsafe { SerialPort::new(0x3F8) };
            port.init();
            SpinLock::new(port)
        };
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(target_os = "none")]
    {
        port::COM1
            .lock()
            .write_fmt(args)
            .expect("serial write failed");
    }

    #[cfg(not(target_os = "none"))]
    {
        extern crate std;
        use std::io::Write as _;
        let _ = std::io::stderr().write_fmt(args);
    }
}

/// `log::Log` implementation writing through the serial console.
struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= config::LOG_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        crate::println!("[{} {}] {}", tag, record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install the serial logger as the `log` facade backend. Called once during
/// early boot, before any subsystem init runs.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}
