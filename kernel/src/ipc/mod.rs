//! Port-based IPC.
//!
//! Named ports accept connection attempts; an accepted attempt becomes a
//! connection with one endpoint per side, each owning a bounded inbound
//! message queue. Hangup severs one direction at a time and a surviving
//! peer can drain in-flight messages before seeing `DestUnreachable`.

pub mod connection;
pub mod message;
pub mod port;

pub use connection::{ConnectionEnd, CLIENT, SERVER};
pub use message::Message;
pub use port::Port;

/// Log the subsystem as ready. The registries are lazily built statics.
pub fn init() {
    log::info!(
        "ipc online: message max {} bytes, queue depth {}",
        crate::config::MESSAGE_MAX,
        crate::config::QUEUE_MAX
    );
}
