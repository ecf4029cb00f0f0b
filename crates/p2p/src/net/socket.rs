//! Buffered non-blocking peer socket.

use std::io::{self, Read, Write};
use std::net::{self, Shutdown, SocketAddr};
use std::sync::Mutex;

/// A non-blocking TCP stream with a buffered write queue.
///
/// Reads go straight to the stream; writes are queued and flushed
/// opportunistically, with the remainder drained when the selector
/// reports the socket writable again.
#[derive(Debug)]
pub struct Socket {
    stream: net::TcpStream,
    queue: Mutex<Vec<u8>>,
}

impl Socket {
    pub fn from(stream: net::TcpStream) -> Self {
        Self {
            stream,
            queue: Mutex::new(Vec::new()),
        }
    }

    /// The underlying stream, for selector registration.
    pub fn raw(&self) -> &net::TcpStream {
        &self.stream
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Read available bytes without blocking.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    /// Queue bytes and try to flush them. Returns `true` when the queue
    /// drained completely; `false` leaves a remainder for the selector's
    /// next writable event.
    pub fn push(&self, bytes: &[u8]) -> io::Result<bool> {
        let mut queue = self.queue.lock().expect("socket queue lock is never poisoned");
        queue.extend_from_slice(bytes);
        Self::drain(&self.stream, &mut queue)
    }

    /// Flush as much of the queue as the socket accepts.
    pub fn flush(&self) -> io::Result<bool> {
        let mut queue = self.queue.lock().expect("socket queue lock is never poisoned");
        Self::drain(&self.stream, &mut queue)
    }

    /// Whether queued bytes are waiting on a writable socket.
    pub fn has_pending_writes(&self) -> bool {
        !self
            .queue
            .lock()
            .expect("socket queue lock is never poisoned")
            .is_empty()
    }

    fn drain(stream: &net::TcpStream, queue: &mut Vec<u8>) -> io::Result<bool> {
        let mut written = 0;
        while written < queue.len() {
            match (&*stream).write(&queue[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    break
                }
                Err(e) => {
                    queue.drain(..written);
                    return Err(e);
                }
            }
        }
        queue.drain(..written);
        Ok(queue.is_empty())
    }

    /// Shut the connection down, ignoring a socket that is already gone.
    pub fn disconnect(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}
