//! System-call dispatch.
//!
//! A static table maps each index to a handler and its argument count; the
//! architecture entry stub moves user register values into a
//! [`SyscallFrame`] and calls [`dispatch`], which validates the index and
//! zeroes every register beyond the entry's declared argument count before
//! the handler runs. Results map onto stable status codes: non-negative
//! success values, negative error codes. Every pointer argument goes
//! through the safe user-access façade, and a pending kill takes effect on
//! the way back out to user mode.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    ipc::{self, ConnectionEnd, Message, Port},
    mm::{area, user, Protection},
    object::{object_wait, HandleFlags, ObjectType, Rights, WaitEvent},
    process,
    sched::{self, thread, ThreadId},
    sync::Timeout,
};

/// Raw argument registers as captured by the entry stub.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallFrame {
    pub args: [u64; 6],
}

/// One dispatch-table entry.
pub struct SyscallEntry {
    pub name: &'static str,
    pub arg_count: u8,
    pub handler: fn(&SyscallFrame) -> KernelResult<u64>,
}

// Syscall numbers. Stable; holes are not reused.
pub const SYS_THREAD_EXIT: usize = 0;
pub const SYS_THREAD_YIELD: usize = 1;
pub const SYS_THREAD_KILL: usize = 2;
pub const SYS_SYSTEM_TIME: usize = 3;
pub const SYS_HANDLE_CLOSE: usize = 4;
pub const SYS_OBJECT_WAIT: usize = 5;
pub const SYS_PORT_CREATE: usize = 6;
pub const SYS_PORT_OPEN: usize = 7;
pub const SYS_PORT_LISTEN: usize = 8;
pub const SYS_IPC_SEND: usize = 9;
pub const SYS_IPC_RECEIVE: usize = 10;
pub const SYS_AREA_CREATE: usize = 11;
pub const SYS_AREA_RESIZE: usize = 12;
pub const SYS_AREA_MAP: usize = 13;
pub const SYS_AREA_UNMAP: usize = 14;

/// The dispatch table. Index = syscall number.
pub static SYSCALL_TABLE: &[SyscallEntry] = &[
    SyscallEntry {
        name: "thread_exit",
        arg_count: 0,
        handler: sys_thread_exit,
    },
    SyscallEntry {
        name: "thread_yield",
        arg_count: 0,
        handler: sys_thread_yield,
    },
    SyscallEntry {
        name: "thread_kill",
        arg_count: 1,
        handler: sys_thread_kill,
    },
    SyscallEntry {
        name: "system_time",
        arg_count: 0,
        handler: sys_system_time,
    },
    SyscallEntry {
        name: "handle_close",
        arg_count: 1,
        handler: sys_handle_close,
    },
    SyscallEntry {
        name: "object_wait",
        arg_count: 3,
        handler: sys_object_wait,
    },
    SyscallEntry {
        name: "port_create",
        arg_count: 1,
        handler: sys_port_create,
    },
    SyscallEntry {
        name: "port_open",
        arg_count: 2,
        handler: sys_port_open,
    },
    SyscallEntry {
        name: "port_listen",
        arg_count: 2,
        handler: sys_port_listen,
    },
    SyscallEntry {
        name: "ipc_send",
        arg_count: 5,
        handler: sys_ipc_send,
    },
    SyscallEntry {
        name: "ipc_receive",
        arg_count: 6,
        handler: sys_ipc_receive,
    },
    SyscallEntry {
        name: "area_create",
        arg_count: 1,
        handler: sys_area_create,
    },
    SyscallEntry {
        name: "area_resize",
        arg_count: 2,
        handler: sys_area_resize,
    },
    SyscallEntry {
        name: "area_map",
        arg_count: 6,
        handler: sys_area_map,
    },
    SyscallEntry {
        name: "area_unmap",
        arg_count: 1,
        handler: sys_area_unmap,
    },
];

/// Keep only the arguments the table declares for `entry`; the entry stub
/// hands over all six registers, and whatever user code left in the
/// undeclared ones must never reach a handler.
fn scrub_frame(entry: &SyscallEntry, frame: &SyscallFrame) -> SyscallFrame {
    let mut scrubbed = SyscallFrame::default();
    let count = (entry.arg_count as usize).min(scrubbed.args.len());
    scrubbed.args[..count].copy_from_slice(&frame.args[..count]);
    scrubbed
}

/// Entry point called by the architecture stub.
pub fn dispatch(number: usize, frame: &SyscallFrame) -> i64 {
    let result = match SYSCALL_TABLE.get(number) {
        Some(entry) => (entry.handler)(&scrub_frame(entry, frame)),
        None => Err(KernelError::InvalidArgument),
    };

    // Kernel-to-user transition: a pending kill lands here at the latest.
    let current = sched::current_thread();
    if current.killed() && !current.is_kernel() {
        thread::exit();
    }

    match result {
        Ok(value) => {
            debug_assert!(value <= i64::MAX as u64, "syscall result overflows status");
            value as i64
        }
        Err(e) => e.to_status(),
    }
}

fn timeout_arg(raw: u64) -> Timeout {
    raw as i64
}

// ---------------------------------------------------------------------------
// Thread and time
// ---------------------------------------------------------------------------

fn sys_thread_exit(_frame: &SyscallFrame) -> KernelResult<u64> {
    thread::exit();
}

fn sys_thread_yield(_frame: &SyscallFrame) -> KernelResult<u64> {
    sched::yield_now();
    Ok(0)
}

fn sys_thread_kill(frame: &SyscallFrame) -> KernelResult<u64> {
    let target = thread::find(ThreadId(frame.args[0])).ok_or(KernelError::NotFound)?;
    // Only threads of the caller's own process may be killed here.
    let caller = process::current();
    let owner = target.process().ok_or(KernelError::AccessDenied)?;
    if owner.id() != caller.id() {
        return Err(KernelError::AccessDenied);
    }
    thread::kill(&target)?;
    Ok(0)
}

fn sys_system_time(_frame: &SyscallFrame) -> KernelResult<u64> {
    Ok(crate::timer::system_time())
}

// ---------------------------------------------------------------------------
// Handles and waiting
// ---------------------------------------------------------------------------

fn sys_handle_close(frame: &SyscallFrame) -> KernelResult<u64> {
    process::current()
        .handle_table()
        .detach(frame.args[0] as u32)?;
    Ok(0)
}

fn wait_event_from_raw(raw: u32) -> KernelResult<WaitEvent> {
    match raw {
        0 => Ok(WaitEvent::ConnectionPending),
        1 => Ok(WaitEvent::MessageArrived),
        2 => Ok(WaitEvent::Hangup),
        3 => Ok(WaitEvent::Terminated),
        _ => Err(KernelError::InvalidArgument),
    }
}

/// args: descriptor array pointer, descriptor count, timeout. Each
/// descriptor is (handle: u32, event: u32).
fn sys_object_wait(frame: &SyscallFrame) -> KernelResult<u64> {
    const MAX_DESCRIPTORS: usize = 64;
    let count = frame.args[1] as usize;
    if count == 0 || count > MAX_DESCRIPTORS {
        return Err(KernelError::InvalidArgument);
    }
    let raw = user::copy_in_vec(frame.args[0], count * 8)?;
    let table = process::current();
    let table = table.handle_table();
    let mut descriptors = Vec::with_capacity(count);
    for chunk in raw.chunks_exact(8) {
        let id = u32::from_ne_bytes(chunk[0..4].try_into().expect("chunk size"));
        let event = u32::from_ne_bytes(chunk[4..8].try_into().expect("chunk size"));
        let handle = table.lookup(id, None, Rights::empty())?;
        descriptors.push((handle, wait_event_from_raw(event)?));
    }
    let index = object_wait(&descriptors, timeout_arg(frame.args[2]))?;
    Ok(index as u64)
}

// ---------------------------------------------------------------------------
// IPC
// ---------------------------------------------------------------------------

/// args: out-pointer receiving the port id. Returns the handle id.
fn sys_port_create(frame: &SyscallFrame) -> KernelResult<u64> {
    let (handle, port_id) = ipc::port::create()?;
    user::copy_out(frame.args[0], &port_id.to_ne_bytes())?;
    let id = process::current()
        .handle_table()
        .attach(handle, HandleFlags::empty())?;
    Ok(id as u64)
}

/// args: port id, timeout. Returns the client endpoint handle id.
fn sys_port_open(frame: &SyscallFrame) -> KernelResult<u64> {
    let handle = ipc::port::open(frame.args[0] as u32, timeout_arg(frame.args[1]))?;
    let id = process::current()
        .handle_table()
        .attach(handle, HandleFlags::empty())?;
    Ok(id as u64)
}

/// args: port handle id, timeout. Returns the server endpoint handle id.
fn sys_port_listen(frame: &SyscallFrame) -> KernelResult<u64> {
    let process = process::current();
    let port_handle =
        process
            .handle_table()
            .lookup(frame.args[0] as u32, Some(ObjectType::Port), Rights::RECEIVE)?;
    let port = port_handle.downcast::<Port>()?;
    let server = ipc::port::listen(&port, timeout_arg(frame.args[1]))?;
    let id = process.handle_table().attach(server, HandleFlags::empty())?;
    Ok(id as u64)
}

/// args: endpoint handle id, tag, payload pointer, payload length, timeout.
fn sys_ipc_send(frame: &SyscallFrame) -> KernelResult<u64> {
    let len = frame.args[3] as usize;
    if len > crate::config::MESSAGE_MAX {
        return Err(KernelError::InvalidArgument);
    }
    let process = process::current();
    let handle = process.handle_table().lookup(
        frame.args[0] as u32,
        Some(ObjectType::Connection),
        Rights::SEND,
    )?;
    let end = handle.downcast::<ConnectionEnd>()?;
    let payload = user::copy_in_vec(frame.args[2], len)?;
    let msg = Message::new(frame.args[1] as u32, payload)?;
    end.send(msg, timeout_arg(frame.args[4]))?;
    Ok(0)
}

/// args: endpoint handle id, tag out-pointer, buffer pointer, buffer
/// capacity, timeout, peek flag. Returns the payload length.
fn sys_ipc_receive(frame: &SyscallFrame) -> KernelResult<u64> {
    let process = process::current();
    let handle = process.handle_table().lookup(
        frame.args[0] as u32,
        Some(ObjectType::Connection),
        Rights::RECEIVE,
    )?;
    let end = handle.downcast::<ConnectionEnd>()?;
    let msg = end.receive(timeout_arg(frame.args[4]), frame.args[5] != 0)?;
    if msg.len() > frame.args[3] as usize {
        return Err(KernelError::InvalidArgument);
    }
    user::copy_out(frame.args[1], &msg.tag().to_ne_bytes())?;
    user::copy_out(frame.args[2], msg.data())?;
    Ok(msg.len() as u64)
}

// ---------------------------------------------------------------------------
// Areas
// ---------------------------------------------------------------------------

/// args: size. Returns the area handle id.
fn sys_area_create(frame: &SyscallFrame) -> KernelResult<u64> {
    let handle = area::create_anonymous(frame.args[0], Rights::READ | Rights::WRITE)?;
    let id = process::current()
        .handle_table()
        .attach(handle, HandleFlags::empty())?;
    Ok(id as u64)
}

/// args: area handle id, new size.
fn sys_area_resize(frame: &SyscallFrame) -> KernelResult<u64> {
    let process = process::current();
    let handle =
        process
            .handle_table()
            .lookup(frame.args[0] as u32, Some(ObjectType::Area), Rights::WRITE)?;
    if let Ok(anon) = handle.downcast::<area::AnonymousArea>() {
        anon.resize(frame.args[1])?;
    } else {
        let backed = handle.downcast::<area::BackedArea>()?;
        backed.resize(frame.args[1])?;
    }
    Ok(0)
}

fn protection_from_raw(raw: u64) -> KernelResult<Protection> {
    Protection::from_bits(raw as u32).ok_or(KernelError::InvalidArgument)
}

/// args: area handle id, address hint (0 = any), size, offset, protection
/// bits, shared flag. Returns the mapped base address.
fn sys_area_map(frame: &SyscallFrame) -> KernelResult<u64> {
    let process = process::current();
    let handle = process
        .handle_table()
        .lookup(frame.args[0] as u32, Some(ObjectType::Area), Rights::empty())?;
    let hint = match frame.args[1] {
        0 => None,
        addr => Some(crate::mm::VirtAddr::new(addr)),
    };
    let base = process.address_space().map_area(
        handle,
        hint,
        frame.args[2],
        frame.args[3],
        protection_from_raw(frame.args[4])?,
        frame.args[5] != 0,
    )?;
    Ok(base.as_u64())
}

/// args: mapped base address.
fn sys_area_unmap(frame: &SyscallFrame) -> KernelResult<u64> {
    process::current()
        .address_space()
        .unmap_region(crate::mm::VirtAddr::new(frame.args[0]))?;
    Ok(0)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn table_numbers_match_positions() {
        assert_eq!(SYSCALL_TABLE[SYS_THREAD_EXIT].name, "thread_exit");
        assert_eq!(SYSCALL_TABLE[SYS_PORT_LISTEN].name, "port_listen");
        assert_eq!(SYSCALL_TABLE[SYS_AREA_UNMAP].name, "area_unmap");
        assert_eq!(SYSCALL_TABLE.len(), SYS_AREA_UNMAP + 1);
    }

    #[test]
    fn dispatch_scrubs_undeclared_arguments() {
        let mut frame = SyscallFrame::default();
        frame.args = [1, 2, 3, 4, 5, 6];
        let scrubbed = scrub_frame(&SYSCALL_TABLE[SYS_HANDLE_CLOSE], &frame);
        assert_eq!(scrubbed.args, [1, 0, 0, 0, 0, 0]);
        let scrubbed = scrub_frame(&SYSCALL_TABLE[SYS_SYSTEM_TIME], &frame);
        assert_eq!(scrubbed.args, [0; 6]);
        let scrubbed = scrub_frame(&SYSCALL_TABLE[SYS_IPC_RECEIVE], &frame);
        assert_eq!(
            scrubbed.args, frame.args,
            "six-argument calls keep every register"
        );
    }

    #[test]
    fn unknown_syscall_is_invalid_argument() {
        crate::mm::vas::init();
        let frame = SyscallFrame::default();
        assert_eq!(
            dispatch(SYSCALL_TABLE.len(), &frame),
            KernelError::InvalidArgument.to_status()
        );
    }

    #[test]
    fn system_time_returns_nonnegative_status() {
        crate::mm::vas::init();
        let frame = SyscallFrame::default();
        assert!(dispatch(SYS_SYSTEM_TIME, &frame) >= 0);
    }

    #[test]
    fn handle_close_of_unknown_handle_fails() {
        crate::mm::vas::init();
        let mut frame = SyscallFrame::default();
        frame.args[0] = 1234;
        assert_eq!(
            dispatch(SYS_HANDLE_CLOSE, &frame),
            KernelError::InvalidHandle.to_status()
        );
    }

    #[test]
    fn ipc_send_rejects_oversized_payload() {
        crate::mm::vas::init();
        let mut frame = SyscallFrame::default();
        frame.args[3] = (crate::config::MESSAGE_MAX + 1) as u64;
        assert_eq!(
            dispatch(SYS_IPC_SEND, &frame),
            KernelError::InvalidArgument.to_status()
        );
    }
}
