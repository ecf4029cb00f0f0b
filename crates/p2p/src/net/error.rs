//! Networking errors.

use std::io;

use thiserror::Error;

use crate::handshake::HandshakeError;

/// An error occuring in the networking core.
///
/// Peer-scoped failures (I/O, protocol, handshake) disconnect the peer
/// they occured on and are never surfaced to the remote as a structured
/// reply; persistence failures on opportunistic paths are logged and
/// skipped; `Shutdown` is fatal to the subsystem.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A malformed or illegal frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] quill_types::messages::Error),

    /// A handshake rule was violated.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// An operation did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// An error propagated from the repository.
    #[error("repository error: {0}")]
    Persistence(String),

    /// The subsystem is shutting down.
    #[error("network is shutting down")]
    Shutdown,
}
