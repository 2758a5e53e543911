//! Connections and endpoints.
//!
//! A connection is a pair of endpoints created by a connection attempt.
//! One lock covers the whole connection (both queues, the open flags, the
//! port back-pointer); the flow-control semaphores sit outside it so no
//! lock is ever held across a suspension point. Senders take a space token
//! for the remote queue first, then re-check hangup under the lock.

use alloc::{collections::VecDeque, sync::Arc};
use core::any::Any;

use crate::{
    config::QUEUE_MAX,
    error::{KernelError, KernelResult},
    object::{Handle, KernelObject, Notifier, ObjectType, Rights, WaitEvent, Waiter},
    sync::{Semaphore, SpinLock, Timeout, WaitStatus},
};

use super::{port::Port, Message};

/// Endpoint index of the accepting (port-owning) side.
pub const SERVER: usize = 0;
/// Endpoint index of the connecting side.
pub const CLIENT: usize = 1;

/// Lifecycle of the connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AttemptState {
    Pending,
    Accepted,
    Rejected,
}

pub(super) struct ConnInner {
    /// Originating port; cleared when the port closes or both ends do.
    pub(super) port: Option<Arc<Port>>,
    pub(super) state: AttemptState,
    /// Whether each side's endpoint is still open.
    pub(super) open: [bool; 2],
    /// Inbound message queue per side.
    queues: [VecDeque<Message>; 2],
}

/// A connection: two endpoints under a single lock, plus the per-side
/// semaphores and notifiers that live outside it.
pub struct Connection {
    pub(super) inner: SpinLock<ConnInner>,
    /// Wakes the connecting client when the attempt settles.
    pub(super) attempt_sem: Semaphore,
    /// Space available in each side's inbound queue.
    space_sems: [Semaphore; 2],
    /// Messages available in each side's inbound queue.
    data_sems: [Semaphore; 2],
    msg_notifiers: [Notifier; 2],
    hangup_notifiers: [Notifier; 2],
}

impl Connection {
    pub(super) fn new(port: Arc<Port>) -> Arc<Self> {
        Arc::new(Self {
            inner: SpinLock::new(ConnInner {
                port: Some(port),
                state: AttemptState::Pending,
                open: [false, true],
                queues: [VecDeque::new(), VecDeque::new()],
            }),
            attempt_sem: Semaphore::new("ipc-attempt", 0),
            space_sems: [
                Semaphore::new("ipc-space", QUEUE_MAX),
                Semaphore::new("ipc-space", QUEUE_MAX),
            ],
            data_sems: [
                Semaphore::new("ipc-data", 0),
                Semaphore::new("ipc-data", 0),
            ],
            msg_notifiers: [Notifier::new(), Notifier::new()],
            hangup_notifiers: [Notifier::new(), Notifier::new()],
        })
    }

    /// Wake everything blocked on any of the connection's semaphores so it
    /// re-examines the open flags.
    fn disturb_all(&self) {
        for side in [SERVER, CLIENT] {
            self.space_sems[side].disturb_all();
            self.data_sems[side].disturb_all();
        }
    }
}

/// One side of a connection; the object user handles refer to.
pub struct ConnectionEnd {
    conn: Arc<Connection>,
    side: usize,
}

impl ConnectionEnd {
    pub(super) fn new(conn: Arc<Connection>, side: usize) -> Arc<Self> {
        Arc::new(Self { conn, side })
    }

    /// Standard rights for a freshly created endpoint handle.
    pub fn default_rights() -> Rights {
        Rights::SEND | Rights::RECEIVE
    }

    pub fn side(&self) -> usize {
        self.side
    }

    fn remote(&self) -> usize {
        1 - self.side
    }

    /// Queue `msg` for the remote side. Blocks while the remote queue is
    /// full; fails with `DestUnreachable` once the remote has hung up.
    pub fn send(&self, msg: Message, timeout: Timeout) -> KernelResult<()> {
        let remote = self.remote();
        loop {
            if !self.conn.inner.lock().open[remote] {
                return Err(KernelError::DestUnreachable);
            }
            match self.conn.space_sems[remote].down_status(timeout, true) {
                WaitStatus::Woken => {
                    {
                        let mut inner = self.conn.inner.lock();
                        if !inner.open[remote] {
                            drop(inner);
                            // Hand the token back; the queue is dead.
                            self.conn.space_sems[remote].up();
                            return Err(KernelError::DestUnreachable);
                        }
                        inner.queues[remote].push_back(msg);
                    }
                    self.conn.data_sems[remote].up();
                    self.conn.msg_notifiers[remote].notify(WaitEvent::MessageArrived);
                    return Ok(());
                }
                WaitStatus::TimedOut => return Err(KernelError::TimedOut),
                WaitStatus::Interrupted => return Err(KernelError::Interrupted),
                // Hangup broadcast: loop re-checks the open flag.
                WaitStatus::Disturbed => continue,
            }
        }
    }

    /// Dequeue (or, with `peek`, copy) the head of this side's queue.
    /// Queued messages remain receivable after the remote hangs up; only an
    /// empty queue with a hung-up remote reports `DestUnreachable`.
    pub fn receive(&self, timeout: Timeout, peek: bool) -> KernelResult<Message> {
        let side = self.side;
        loop {
            {
                let inner = self.conn.inner.lock();
                if inner.queues[side].is_empty() && !inner.open[self.remote()] {
                    return Err(KernelError::DestUnreachable);
                }
            }
            match self.conn.data_sems[side].down_status(timeout, true) {
                WaitStatus::Woken => {
                    let mut inner = self.conn.inner.lock();
                    if peek {
                        let msg = inner.queues[side]
                            .front()
                            .cloned()
                            .expect("data token without a queued message");
                        drop(inner);
                        self.conn.data_sems[side].up();
                        return Ok(msg);
                    }
                    let msg = inner.queues[side]
                        .pop_front()
                        .expect("data token without a queued message");
                    drop(inner);
                    self.conn.space_sems[side].up();
                    return Ok(msg);
                }
                WaitStatus::TimedOut => return Err(KernelError::TimedOut),
                WaitStatus::Interrupted => return Err(KernelError::Interrupted),
                WaitStatus::Disturbed => continue,
            }
        }
    }

    /// Messages currently queued for this side.
    pub fn pending(&self) -> usize {
        self.conn.inner.lock().queues[self.side].len()
    }

    /// Has the remote side hung up?
    pub fn remote_hung_up(&self) -> bool {
        !self.conn.inner.lock().open[self.remote()]
    }

    /// Sever this side: clear the remote's view of us, wake every blocked
    /// party, and fire the remote's hangup notifier. The connection object
    /// itself survives until both endpoint handles are gone.
    fn hangup(&self) {
        let port = {
            let mut inner = self.conn.inner.lock();
            if !inner.open[self.side] && inner.state != AttemptState::Pending {
                return;
            }
            inner.open[self.side] = false;
            if inner.state == AttemptState::Pending {
                // Closing a never-accepted client handle abandons the
                // attempt; a later listen skips it.
                inner.state = AttemptState::Rejected;
            }
            let both_closed = !inner.open[SERVER] && !inner.open[CLIENT];
            if both_closed {
                inner.port.take()
            } else {
                None
            }
        };
        self.conn.disturb_all();
        self.conn.hangup_notifiers[self.remote()].notify(WaitEvent::Hangup);
        if let Some(port) = port {
            port.detach_connection(&self.conn);
        }
    }

    /// Port-close path: sever this side on behalf of the dying port.
    pub(super) fn hangup_for_port_close(&self) {
        self.hangup();
    }
}

impl KernelObject for ConnectionEnd {
    fn object_type(&self) -> ObjectType {
        ObjectType::Connection
    }

    fn close(&self, _handle: &Handle) {
        self.hangup();
    }

    fn wait(&self, waiter: &Arc<Waiter>, index: usize, event: WaitEvent) -> KernelResult<()> {
        match event {
            WaitEvent::MessageArrived => {
                // Register first so a concurrent arrival cannot slip between
                // the emptiness check and the registration.
                self.conn.msg_notifiers[self.side].register(waiter, index, event);
                if !self.conn.inner.lock().queues[self.side].is_empty() {
                    waiter.signal(index);
                }
                Ok(())
            }
            WaitEvent::Hangup => {
                self.conn.hangup_notifiers[self.side].register(waiter, index, event);
                if self.remote_hung_up() {
                    waiter.signal(index);
                }
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    fn unwait(&self, waiter: &Arc<Waiter>, index: usize, event: WaitEvent) {
        match event {
            WaitEvent::MessageArrived => {
                self.conn.msg_notifiers[self.side].unregister(waiter, index, event)
            }
            WaitEvent::Hangup => {
                self.conn.hangup_notifiers[self.side].unregister(waiter, index, event)
            }
            _ => {}
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::ipc::port;
    use alloc::vec;

    fn pair() -> (Arc<Handle>, Arc<Handle>) {
        let (port_handle, id) = port::create().expect("port");
        // Queue the attempt, then accept it; completing the open cannot
        // block because listen has already settled the attempt.
        let attempt = port::begin_open(id).expect("attempt queued");
        let port_obj = port_handle.downcast::<Port>().expect("port object");
        let server = port::listen(&port_obj, 0).expect("accept");
        let client = port::complete_open(attempt, 0).expect("client handle");
        (server, client)
    }

    fn end(handle: &Arc<Handle>) -> Arc<ConnectionEnd> {
        handle.downcast::<ConnectionEnd>().expect("endpoint")
    }

    #[test]
    fn echo_round_trip_preserves_bytes_and_order() {
        let (server, client) = pair();
        let (server, client) = (end(&server), end(&client));

        client
            .send(Message::new(1, b"hello".to_vec()).expect("msg"), 0)
            .expect("send");
        let msg = server.receive(0, false).expect("receive");
        assert_eq!((msg.tag(), msg.data()), (1, &b"hello"[..]));

        server
            .send(Message::new(2, msg.into_data()).expect("msg"), 0)
            .expect("reply");
        let reply = client.receive(0, false).expect("reply receive");
        assert_eq!((reply.tag(), reply.data()), (2, &b"hello"[..]));
    }

    #[test]
    fn single_sender_fifo_order() {
        let (server, client) = pair();
        let (server, client) = (end(&server), end(&client));
        for i in 0..10u32 {
            client
                .send(Message::new(i, vec![i as u8]).expect("msg"), 0)
                .expect("send");
        }
        for i in 0..10u32 {
            let msg = server.receive(0, false).expect("receive");
            assert_eq!(msg.tag(), i);
            assert_eq!(msg.data(), &[i as u8]);
        }
    }

    #[test]
    fn peek_leaves_message_queued() {
        let (server, client) = pair();
        let (server, client) = (end(&server), end(&client));
        client
            .send(Message::new(9, b"peek".to_vec()).expect("msg"), 0)
            .expect("send");
        let peeked = server.receive(0, true).expect("peek");
        assert_eq!(server.pending(), 1);
        let received = server.receive(0, false).expect("receive");
        assert_eq!(peeked, received);
        assert_eq!(server.pending(), 0);
    }

    #[test]
    fn hangup_lets_survivor_drain_then_fails() {
        let (server, client) = pair();
        let client_end = end(&client);
        client_end
            .send(Message::new(1, b"a".to_vec()).expect("msg"), 0)
            .expect("send");
        client_end
            .send(Message::new(2, b"b".to_vec()).expect("msg"), 0)
            .expect("send");
        drop(client);

        let server_end = end(&server);
        assert!(server_end.remote_hung_up());
        // Queued messages drain in order, then the hangup surfaces.
        assert_eq!(server_end.receive(0, false).expect("drain a").tag(), 1);
        assert_eq!(server_end.receive(0, false).expect("drain b").tag(), 2);
        assert_eq!(
            server_end.receive(0, false).unwrap_err(),
            KernelError::DestUnreachable
        );
        // Sending toward the dead side fails outright.
        assert_eq!(
            server_end
                .send(Message::new(3, b"c".to_vec()).expect("msg"), 0)
                .unwrap_err(),
            KernelError::DestUnreachable
        );
    }

    #[test]
    fn full_queue_rejects_try_send() {
        let (server, client) = pair();
        let client_end = end(&client);
        for i in 0..QUEUE_MAX {
            client_end
                .send(Message::new(i, vec![]).expect("msg"), 0)
                .expect("send within queue bound");
        }
        assert_eq!(
            client_end
                .send(Message::new(QUEUE_MAX, vec![]).expect("msg"), 0)
                .unwrap_err(),
            KernelError::TimedOut,
            "try-send against a full queue must fail immediately"
        );
        let _ = server;
    }

    #[test]
    fn endpoints_signal_message_and_hangup_events() {
        use crate::object::object_wait;
        let (server, client) = pair();
        let server_end = end(&server);

        assert_eq!(
            object_wait(&[(server.clone(), WaitEvent::MessageArrived)], 0),
            Err(KernelError::TimedOut)
        );
        end(&client)
            .send(Message::new(1, b"x".to_vec()).expect("msg"), 0)
            .expect("send");
        assert_eq!(
            object_wait(&[(server.clone(), WaitEvent::MessageArrived)], 0),
            Ok(0)
        );

        drop(client);
        assert_eq!(object_wait(&[(server.clone(), WaitEvent::Hangup)], 0), Ok(0));
        let _ = server_end;
    }
}
