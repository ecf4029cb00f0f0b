//! Peer-to-peer networking core of the quill node.
//!
//! The [`network::NetworkManager`] owns all connections and drives them
//! through a single non-blocking selector plus a small worker pool
//! ([`net::engine`]). Decoded messages flow through the per-peer
//! handshake state machine ([`handshake`]) until it completes, then on
//! to the consumed [`controller::Controller`].
#![allow(clippy::type_complexity)]

pub mod common;
pub mod config;
pub mod controller;
pub mod handshake;
pub mod net;
pub mod network;
pub mod peer;

pub use config::Config;
pub use network::NetworkManager;
