//! Poll-based selector shared by the worker pool.
//!
//! Exactly one pool thread (the current producer) polls at a time; other
//! threads only touch the selector through short, bounded critical
//! sections to re-arm interest, waking any in-flight poll first.

use std::collections::VecDeque;
use std::io;
use std::net::{self, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, trace};

use crate::net::Source;

/// Listener backlog length.
const BACKLOG: i32 = 10;

/// A readiness event the selector owes the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The listener has connections waiting.
    Acceptable,
    /// A peer socket has bytes to read. Read interest is cleared until
    /// the read task re-arms it.
    Readable(SocketAddr),
    /// A peer socket accepts writes again. Write interest is cleared
    /// until a task re-arms it.
    Writable(SocketAddr),
}

/// Wakes the selector out of a blocking poll.
#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    pub fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// The poll source set plus the queue of readiness events not yet
/// turned into tasks.
pub struct Selector {
    sources: popol::Sources<Source>,
    events: Vec<popol::Event<Source>>,
    pending: VecDeque<ChannelEvent>,
    listener: Option<net::TcpListener>,
}

impl Selector {
    pub fn new() -> io::Result<(Self, Waker)> {
        let mut sources = popol::Sources::new();
        let waker = Waker(Arc::new(popol::Waker::new(&mut sources, Source::Waker)?));

        Ok((
            Self {
                sources,
                events: Vec::with_capacity(32),
                pending: VecDeque::new(),
                listener: None,
            },
            waker,
        ))
    }

    /// Bind the listening socket and start watching it.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = listen(addr)?;
        let local_addr = listener.local_addr()?;

        self.sources
            .register(Source::Listener, &listener, popol::interest::READ);
        self.listener = Some(listener);

        Ok(local_addr)
    }

    /// Stop accepting: unregister and close the listener.
    pub fn close_listener(&mut self) {
        if self.listener.take().is_some() {
            self.sources.unregister(&Source::Listener);
        }
    }

    /// Accept one waiting connection, or `None` when the backlog is
    /// drained.
    pub fn accept(&self) -> io::Result<Option<(net::TcpStream, SocketAddr)>> {
        let Some(ref listener) = self.listener else {
            return Ok(None);
        };
        match listener.accept() {
            Ok((conn, addr)) => Ok(Some((conn, addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Register an established peer stream, watching for reads.
    pub fn register_peer(&mut self, addr: SocketAddr, stream: &net::TcpStream) {
        self.sources
            .register(Source::Peer(addr), stream, popol::interest::READ);
    }

    /// Register a dialing stream. A non-blocking connect is established
    /// once the socket reports writable.
    pub fn register_dialing(&mut self, addr: SocketAddr, stream: &net::TcpStream) {
        self.sources
            .register(Source::Peer(addr), stream, popol::interest::WRITE);
    }

    pub fn unregister_peer(&mut self, addr: SocketAddr) {
        self.sources.unregister(&Source::Peer(addr));
    }

    /// Re-arm read interest after a read task has drained the socket.
    pub fn arm_read(&mut self, addr: SocketAddr) {
        if let Some(source) = self.sources.get_mut(&Source::Peer(addr)) {
            source.set(popol::interest::READ);
        }
    }

    /// Watch for writability, typically because a write queue has a
    /// remainder to flush.
    pub fn arm_write(&mut self, addr: SocketAddr) {
        if let Some(source) = self.sources.get_mut(&Source::Peer(addr)) {
            source.set(popol::interest::WRITE);
        }
    }

    /// Pop the next readiness event owed to the manager.
    pub fn next_event(&mut self) -> Option<ChannelEvent> {
        self.pending.pop_front()
    }

    /// Poll the sources, translating readiness into queued
    /// [`ChannelEvent`]s. Blocks for at most `timeout`.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<()> {
        trace!(
            target: "net",
            "Polling {} source(s), waking up in {:?}..",
            self.sources.len(),
            timeout,
        );

        match self.sources.wait_timeout(&mut self.events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(()),
            Err(err) => return Err(err),
        }

        for event in self.events.drain(..) {
            match &event.key {
                Source::Waker => {
                    popol::Waker::reset(event.source).ok();
                }
                Source::Listener => {
                    if !self.pending.contains(&ChannelEvent::Acceptable) {
                        self.pending.push_back(ChannelEvent::Acceptable);
                    }
                }
                Source::Peer(addr) => {
                    let addr = *addr;

                    if event.is_invalid() {
                        // File descriptor was closed and is invalid.
                        // Nb. This shouldn't happen. It means the source wasn't
                        // properly unregistered, or there is a duplicate source.
                        error!(target: "net", "{}: Socket is invalid, removing", addr);
                        self.sources.unregister(&event.key);
                        continue;
                    }
                    if event.is_error() || event.is_hangup() {
                        // Let the subsequent read fail.
                        trace!(target: "net", "{}: Socket error triggered: {:?}", addr, event);
                    }
                    // Clear interest as the event is queued so a second
                    // poll can't produce a duplicate; the handling task
                    // re-arms it.
                    if event.is_writable() {
                        if let Some(source) = self.sources.get_mut(&Source::Peer(addr)) {
                            source.unset(popol::interest::WRITE);
                        }
                        self.pending.push_back(ChannelEvent::Writable(addr));
                    }
                    if event.is_readable() {
                        if let Some(source) = self.sources.get_mut(&Source::Peer(addr)) {
                            source.unset(popol::interest::READ);
                        }
                        self.pending.push_back(ChannelEvent::Readable(addr));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Connect to a peer given a remote address. The returned stream is
/// non-blocking and likely still connecting; it is established once the
/// selector reports it writable.
pub fn dial(addr: &SocketAddr) -> io::Result<net::TcpStream> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_nonblocking(true)?;

    match sock.connect(&(*addr).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.raw_os_error() == Some(libc::EALREADY) => {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

/// Bind the listening socket: `SO_REUSEADDR`, non-blocking, fixed
/// backlog.
fn listen(addr: SocketAddr) -> io::Result<net::TcpListener> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_reuse_address(true)?;
    sock.bind(&addr.into())?;
    sock.listen(BACKLOG)?;
    sock.set_nonblocking(true)?;

    Ok(sock.into())
}
