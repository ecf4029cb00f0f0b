//! A live peer connection.
//!
//! The `Peer` owns its socket and every per-connection piece of state:
//! the resumable frame decoder and inbox of decoded messages, the write
//! queue, the handshake record, the request/reply waiter table and the
//! ping schedule. It performs no I/O scheduling of its own; the network
//! manager decides when to read, deliver and disconnect.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{self, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use quill_types::messages::{Decoder, RawNetworkMessage};
use quill_types::network::Magic;
use quill_types::{NodeId, PeerAddress};

use crate::common::peer::PeerData;
use crate::handshake::Handshake;
use crate::net::socket::Socket;
use crate::net::{Link, LocalDuration, LocalTime};

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 1024 * 64;

/// Why a pending request completed without a reply.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("peer disconnected")]
    Disconnected,
    #[error("network is shutting down")]
    Shutdown,
}

/// Awaits the reply to a request sent with a fresh id.
///
/// The caller holds this handle instead of blocking inside the peer;
/// disconnect and shutdown fail every outstanding handle promptly.
pub struct ResponseHandle {
    rx: flume::Receiver<Result<RawNetworkMessage, RequestError>>,
}

impl ResponseHandle {
    /// Wait for the reply, up to `timeout`.
    pub fn wait(self, timeout: Duration) -> Result<RawNetworkMessage, RequestError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(flume::RecvTimeoutError::Timeout) => Err(RequestError::Timeout),
            Err(flume::RecvTimeoutError::Disconnected) => Err(RequestError::Disconnected),
        }
    }
}

/// Keep-alive bookkeeping for a handshaked peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingState {
    /// Last time any message arrived on this connection.
    pub last_activity: Option<LocalTime>,
    /// Outstanding ping: its id and send time.
    pub inflight: Option<(i32, LocalTime)>,
    /// Smoothed by nothing; simply the latest measurement.
    pub rtt: Option<LocalDuration>,
}

/// What a read against the socket produced.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were consumed; decoded messages sit in the inbox.
    Progress(usize),
    /// The remote performed an orderly shutdown.
    Eof,
}

/// A live connection to a remote node.
pub struct Peer {
    address: PeerAddress,
    resolved: SocketAddr,
    direction: Link,
    socket: Socket,
    connected_at: Mutex<Option<LocalTime>>,
    peer_data: Mutex<PeerData>,
    decoder: Mutex<Decoder>,
    inbox: Mutex<VecDeque<RawNetworkMessage>>,
    /// Held by the worker currently delivering a message, so two
    /// messages for the same peer never execute concurrently.
    delivering: AtomicBool,
    handshake: Mutex<Handshake>,
    next_id: AtomicI32,
    waiters: Mutex<HashMap<i32, flume::Sender<Result<RawNetworkMessage, RequestError>>>>,
    ping: Mutex<PingState>,
    /// Held by the worker running this peer's ping task.
    ping_pending: AtomicBool,
    disconnected: AtomicBool,
}

impl Peer {
    pub fn new(
        address: PeerAddress,
        resolved: SocketAddr,
        stream: net::TcpStream,
        direction: Link,
        peer_data: PeerData,
        magic: Magic,
        max_message_size: u32,
    ) -> Self {
        Self {
            address,
            resolved,
            direction,
            socket: Socket::from(stream),
            connected_at: Mutex::new(None),
            peer_data: Mutex::new(peer_data),
            decoder: Mutex::new(Decoder::new(magic, max_message_size, 1024)),
            inbox: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
            handshake: Mutex::new(Handshake::new()),
            next_id: AtomicI32::new(1),
            waiters: Mutex::new(HashMap::new()),
            ping: Mutex::new(PingState::default()),
            ping_pending: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// The socket address the connection actually runs over; also the
    /// selector key.
    pub fn resolved_addr(&self) -> SocketAddr {
        self.resolved
    }

    pub fn direction(&self) -> Link {
        self.direction
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    // Connection lifecycle ///////////////////////////////////////////////

    pub fn connected_at(&self) -> Option<LocalTime> {
        *self.connected_at.lock().expect("peer lock is never poisoned")
    }

    pub fn mark_connected(&self, now: Option<LocalTime>) {
        *self.connected_at.lock().expect("peer lock is never poisoned") = now;
    }

    /// Close the socket and fail outstanding waiters. Idempotent;
    /// returns `false` on repeat calls. The manager removes the peer
    /// from its connected set and notifies the controller.
    pub fn close(&self, reason: RequestError) -> bool {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.socket.disconnect().ok();
        self.fail_waiters(reason);
        true
    }

    // Peer record ////////////////////////////////////////////////////////

    pub fn peer_data(&self) -> PeerData {
        self.peer_data.lock().expect("peer lock is never poisoned").clone()
    }

    pub fn update_peer_data(&self, f: impl FnOnce(&mut PeerData)) -> PeerData {
        let mut data = self.peer_data.lock().expect("peer lock is never poisoned");
        f(&mut data);
        data.clone()
    }

    // Handshake //////////////////////////////////////////////////////////

    /// Run `f` under the handshake lock. The closure must not call back
    /// into the peer.
    pub fn with_handshake<T>(&self, f: impl FnOnce(&mut Handshake) -> T) -> T {
        let mut hs = self.handshake.lock().expect("peer lock is never poisoned");
        f(&mut hs)
    }

    pub fn is_handshake_completed(&self) -> bool {
        self.with_handshake(|hs| hs.is_completed())
    }

    pub fn remote_node_id(&self) -> Option<NodeId> {
        self.with_handshake(|hs| hs.remote_id)
    }

    /// The protocol version spoken on this connection; meaningful once
    /// the handshake recorded the remote's VERSION.
    pub fn version(&self) -> u32 {
        self.with_handshake(|hs| hs.negotiated_version())
    }

    // Reading and the inbox //////////////////////////////////////////////

    /// Read available bytes and feed the decoder; decoded messages are
    /// queued on the inbox in arrival order.
    ///
    /// Only ever invoked by the channel task holding this peer's read
    /// interest, so reads are serialised without a lock on the stream.
    pub fn fill_inbox(&self) -> Result<ReadOutcome, crate::net::Error> {
        let mut buf = [0; READ_BUFFER_SIZE];

        let count = match self.socket.read(&mut buf) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Progress(0)),
            Err(e) => return Err(e.into()),
        };

        let mut decoder = self.decoder.lock().expect("peer lock is never poisoned");
        decoder.input(&buf[..count]);

        let mut inbox = self.inbox.lock().expect("peer lock is never poisoned");
        while let Some(msg) = decoder.decode_next()? {
            trace!(target: "p2p", "{}: Decoded {:?} (id {})", self.address, msg.kind(), msg.id);
            inbox.push_back(msg);
        }

        Ok(ReadOutcome::Progress(count))
    }

    pub fn has_pending_messages(&self) -> bool {
        !self.inbox.lock().expect("peer lock is never poisoned").is_empty()
    }

    pub fn pop_message(&self) -> Option<RawNetworkMessage> {
        self.inbox.lock().expect("peer lock is never poisoned").pop_front()
    }

    /// Claim the delivery slot; the caller must call [`Peer::end_delivery`].
    pub fn begin_delivery(&self) -> bool {
        self.delivering
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn end_delivery(&self) {
        self.delivering.store(false, Ordering::Release);
    }

    // Writing ////////////////////////////////////////////////////////////

    /// Queue an encoded frame. `Ok(false)` means a remainder waits for
    /// the socket to become writable.
    pub fn enqueue(&self, frame: &[u8]) -> io::Result<bool> {
        self.socket.push(frame)
    }

    // Request correlation ////////////////////////////////////////////////

    /// Next message id: monotonically increasing, never zero.
    pub fn allocate_id(&self) -> i32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Register interest in the reply to `id`.
    pub fn register_waiter(&self, id: i32) -> ResponseHandle {
        let (tx, rx) = flume::bounded(1);
        self.waiters
            .lock()
            .expect("peer lock is never poisoned")
            .insert(id, tx);
        ResponseHandle { rx }
    }

    /// Hand `msg` to the waiter registered under its id, if any.
    pub fn complete_waiter(&self, msg: &RawNetworkMessage) -> bool {
        let waiter = self
            .waiters
            .lock()
            .expect("peer lock is never poisoned")
            .remove(&msg.id);
        match waiter {
            Some(tx) => {
                tx.send(Ok(msg.clone())).ok();
                true
            }
            None => false,
        }
    }

    fn fail_waiters(&self, reason: RequestError) {
        let waiters: Vec<_> = self
            .waiters
            .lock()
            .expect("peer lock is never poisoned")
            .drain()
            .collect();
        for (_, tx) in waiters {
            tx.send(Err(reason)).ok();
        }
    }

    // Pings //////////////////////////////////////////////////////////////

    pub fn with_ping<T>(&self, f: impl FnOnce(&mut PingState) -> T) -> T {
        let mut ping = self.ping.lock().expect("peer lock is never poisoned");
        f(&mut ping)
    }

    pub fn record_activity(&self, now: Option<LocalTime>) {
        if let Some(now) = now {
            self.with_ping(|ping| ping.last_activity = Some(now));
        }
    }

    /// Claim the ping slot; the caller must call [`Peer::end_ping_task`].
    pub fn begin_ping_task(&self) -> bool {
        self.ping_pending
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn end_ping_task(&self) {
        self.ping_pending.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("direction", &self.direction)
            .field("disconnected", &self.disconnected)
            .finish()
    }
}
