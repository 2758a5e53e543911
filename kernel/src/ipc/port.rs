//! Ports: named rendezvous points for connection setup.
//!
//! A global registry maps port ids to live ports. Clients queue a
//! connection attempt and block on the attempt's private semaphore; servers
//! block on the port's pending-attempt semaphore and move accepted
//! connections onto the established list. Closing the last port handle
//! cancels waiting attempts with `DestUnreachable` and hangs up everything
//! established.

use alloc::{collections::BTreeMap, collections::VecDeque, sync::Arc, vec::Vec};
use core::any::Any;

use crate::{
    error::{KernelError, KernelResult},
    object::{Handle, KernelObject, Notifier, ObjectType, Rights, WaitEvent, Waiter},
    sync::{Semaphore, SpinLock, Timeout, WaitStatus},
    util::IdAllocator,
};

use super::connection::{AttemptState, Connection, ConnectionEnd, CLIENT, SERVER};

const MAX_PORTS: usize = 4096;

struct PortInner {
    closed: bool,
    /// Connection attempts not yet accepted, oldest first.
    waiting: VecDeque<Arc<Connection>>,
    established: Vec<Arc<Connection>>,
}

/// A named rendezvous point for inbound connections.
pub struct Port {
    id: u32,
    inner: SpinLock<PortInner>,
    /// One token per queued attempt.
    pending_sem: Semaphore,
    connect_notifier: Notifier,
}

impl Port {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Attempts currently waiting to be accepted.
    pub fn pending_attempts(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Established connections still attached to this port.
    pub fn established_count(&self) -> usize {
        self.inner.lock().established.len()
    }

    /// Unlink a connection whose endpoints are both gone.
    pub(super) fn detach_connection(&self, conn: &Arc<Connection>) {
        let mut inner = self.inner.lock();
        inner.established.retain(|c| !Arc::ptr_eq(c, conn));
    }
}

impl KernelObject for Port {
    fn object_type(&self) -> ObjectType {
        ObjectType::Port
    }

    fn close(&self, _handle: &Handle) {
        close_port(self);
    }

    fn wait(&self, waiter: &Arc<Waiter>, index: usize, event: WaitEvent) -> KernelResult<()> {
        if event != WaitEvent::ConnectionPending {
            return Err(KernelError::InvalidArgument);
        }
        self.connect_notifier.register(waiter, index, event);
        if !self.inner.lock().waiting.is_empty() {
            waiter.signal(index);
        }
        Ok(())
    }

    fn unwait(&self, waiter: &Arc<Waiter>, index: usize, event: WaitEvent) {
        self.connect_notifier.unregister(waiter, index, event);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

static REGISTRY: SpinLock<BTreeMap<u32, Arc<Port>>> = SpinLock::new(BTreeMap::new());
static PORT_IDS: SpinLock<Option<IdAllocator>> = SpinLock::new(None);

fn alloc_id() -> KernelResult<u32> {
    let mut ids = PORT_IDS.lock();
    let ids = ids.get_or_insert_with(|| IdAllocator::new(MAX_PORTS));
    ids.alloc().map(|id| id as u32 + 1).ok_or(KernelError::OutOfMemory)
}

fn free_id(id: u32) {
    let mut ids = PORT_IDS.lock();
    if let Some(ids) = ids.as_mut() {
        ids.free(id as usize - 1);
    }
}

/// Ports currently registered.
pub fn registered_count() -> usize {
    REGISTRY.lock().len()
}

/// Create a port, register it, and return its owning handle plus the id
/// clients connect with.
pub fn create() -> KernelResult<(Arc<Handle>, u32)> {
    let id = alloc_id()?;
    let port = Arc::new(Port {
        id,
        inner: SpinLock::new(PortInner {
            closed: false,
            waiting: VecDeque::new(),
            established: Vec::new(),
        }),
        pending_sem: Semaphore::new("port-pending", 0),
        connect_notifier: Notifier::new(),
    });
    REGISTRY.lock().insert(id, port.clone());
    let handle = Handle::new(port, Rights::RECEIVE | Rights::CONTROL);
    Ok((handle, id))
}

/// Look up a registered port.
pub fn find(id: u32) -> Option<Arc<Port>> {
    REGISTRY.lock().get(&id).cloned()
}

// ---------------------------------------------------------------------------
// Client side: open
// ---------------------------------------------------------------------------

/// Queue a connection attempt on port `id`. First half of [`open`].
pub fn begin_open(id: u32) -> KernelResult<Arc<Connection>> {
    let port = find(id).ok_or(KernelError::NotFound)?;
    let conn = Connection::new(port.clone());
    {
        let mut inner = port.inner.lock();
        if inner.closed {
            return Err(KernelError::NotFound);
        }
        inner.waiting.push_back(conn.clone());
    }
    port.pending_sem.up();
    port.connect_notifier.notify(WaitEvent::ConnectionPending);
    Ok(conn)
}

/// Wait for the attempt to settle and build the client endpoint handle.
/// Second half of [`open`].
pub fn complete_open(conn: Arc<Connection>, timeout: Timeout) -> KernelResult<Arc<Handle>> {
    let status = conn.attempt_sem.down_status(timeout, true);
    let mut inner = conn.inner.lock();
    match inner.state {
        AttemptState::Accepted => {
            drop(inner);
            Ok(Handle::new(
                ConnectionEnd::new(conn, CLIENT),
                ConnectionEnd::default_rights(),
            ))
        }
        AttemptState::Rejected => Err(KernelError::DestUnreachable),
        AttemptState::Pending => {
            // Settle the abandoned attempt so a later listen skips it.
            inner.state = AttemptState::Rejected;
            inner.open[CLIENT] = false;
            match status {
                WaitStatus::TimedOut => Err(KernelError::TimedOut),
                WaitStatus::Interrupted | WaitStatus::Disturbed => Err(KernelError::Interrupted),
                WaitStatus::Woken => Err(KernelError::DestUnreachable),
            }
        }
    }
}

/// Connect to port `id`: queue an attempt and wait for the server to accept
/// it. Fails with `NotFound` for an unknown id and `DestUnreachable` when
/// the port closes while the attempt is pending.
pub fn open(id: u32, timeout: Timeout) -> KernelResult<Arc<Handle>> {
    let conn = begin_open(id)?;
    complete_open(conn, timeout)
}

// ---------------------------------------------------------------------------
// Server side: listen
// ---------------------------------------------------------------------------

/// Accept the oldest pending attempt. Timeout 0 returns `TimedOut`
/// immediately when nothing is pending; the wait is interruptible.
pub fn listen(port: &Arc<Port>, timeout: Timeout) -> KernelResult<Arc<Handle>> {
    loop {
        match port.pending_sem.down_status(timeout, true) {
            WaitStatus::Woken => {}
            WaitStatus::TimedOut => return Err(KernelError::TimedOut),
            WaitStatus::Interrupted | WaitStatus::Disturbed => {
                return Err(KernelError::Interrupted)
            }
        }
        let conn = {
            let mut inner = port.inner.lock();
            if inner.closed {
                return Err(KernelError::NotFound);
            }
            inner.waiting.pop_front()
        };
        let Some(conn) = conn else { continue };

        let accepted = {
            let mut ci = conn.inner.lock();
            if ci.state == AttemptState::Pending && ci.open[CLIENT] {
                ci.state = AttemptState::Accepted;
                ci.open[SERVER] = true;
                true
            } else {
                false
            }
        };
        if !accepted {
            // Abandoned attempt; its pending token was consumed above, so
            // the books stay balanced.
            conn.attempt_sem.up();
            continue;
        }
        port.inner.lock().established.push(conn.clone());
        let handle = Handle::new(
            ConnectionEnd::new(conn.clone(), SERVER),
            ConnectionEnd::default_rights(),
        );
        conn.attempt_sem.up();
        return Ok(handle);
    }
}

// ---------------------------------------------------------------------------
// Close
// ---------------------------------------------------------------------------

/// Tear the port down: runs on the last handle release. Waiting attempts
/// are released with `DestUnreachable`; established connections lose their
/// port back-pointer and their server side is hung up.
fn close_port(port: &Port) {
    let (waiting, established) = {
        let mut registry = REGISTRY.lock();
        let mut inner = port.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        registry.remove(&port.id);
        (
            core::mem::take(&mut inner.waiting),
            core::mem::take(&mut inner.established),
        )
    };
    free_id(port.id);

    for conn in waiting {
        {
            let mut ci = conn.inner.lock();
            ci.state = AttemptState::Rejected;
            ci.port = None;
        }
        conn.attempt_sem.up();
    }
    for conn in established {
        let server_end = ConnectionEnd::new(conn.clone(), SERVER);
        {
            let mut ci = conn.inner.lock();
            ci.port = None;
        }
        server_end.hangup_for_port_close();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn create_find_close_round_trip() {
        let (handle, id) = create().expect("port");
        assert!(find(id).is_some());
        drop(handle);
        // Closing the last handle removes the port from the registry.
        assert!(find(id).is_none());
    }

    #[test]
    fn open_unknown_port_is_not_found() {
        assert!(matches!(open(9999, 0), Err(KernelError::NotFound)));
    }

    #[test]
    fn listen_with_zero_timeout_times_out() {
        let (handle, _id) = create().expect("port");
        let port = handle.downcast::<Port>().expect("port object");
        assert_eq!(listen(&port, 0).unwrap_err(), KernelError::TimedOut);
    }

    #[test]
    fn pending_attempt_is_released_on_close() {
        let (handle, id) = create().expect("port");
        let attempt = begin_open(id).expect("attempt");
        drop(handle);
        assert_eq!(
            complete_open(attempt, 0).unwrap_err(),
            KernelError::DestUnreachable
        );
    }

    #[test]
    fn listen_skips_abandoned_attempts() {
        let (handle, id) = create().expect("port");
        let port = handle.downcast::<Port>().expect("port object");
        let attempt = begin_open(id).expect("attempt");
        // The client gives up before the server accepts.
        assert_eq!(
            complete_open(attempt, 0).unwrap_err(),
            KernelError::TimedOut
        );
        assert_eq!(listen(&port, 0).unwrap_err(), KernelError::TimedOut);
    }

    #[test]
    fn port_signals_pending_connections() {
        use crate::object::object_wait;
        let (handle, id) = create().expect("port");
        assert_eq!(
            object_wait(&[(handle.clone(), WaitEvent::ConnectionPending)], 0),
            Err(KernelError::TimedOut)
        );
        let _attempt = begin_open(id).expect("attempt");
        assert_eq!(
            object_wait(&[(handle.clone(), WaitEvent::ConnectionPending)], 0),
            Ok(0)
        );
    }
}
