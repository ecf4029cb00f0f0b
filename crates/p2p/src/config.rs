//! Networking core configuration.
//!
//! An explicitly constructed context handed to [`crate::NetworkManager`];
//! there are no process-wide settings.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use quill_types::messages::{max_message_size, DEFAULT_MAX_BLOCK_SIZE};
use quill_types::Network;

use crate::net::engine::PoolConfig;

/// Target number of outbound connections kept open.
pub const DEFAULT_MIN_OUTBOUND_PEERS: usize = 8;
/// Hard cap on simultaneous connections; accepts past it are closed.
pub const DEFAULT_MAX_PEERS: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    /// Chain to join; selects the frame magic and default port.
    pub network: Network,
    /// Address the listener binds to.
    pub bind_address: IpAddr,
    /// Port the listener binds to.
    pub listen_port: u16,
    /// Keep dialing until this many outbound connections are up.
    pub min_outbound_peers: usize,
    /// Cap on connections in either direction.
    pub max_peers: usize,
    /// Seeded into the repository when it is empty.
    pub initial_peers: Vec<String>,
    /// Bounds the largest frame a peer may send.
    pub max_block_size: u32,
    /// Delay range between per-peer sends of a broadcast, milliseconds.
    pub broadcast_spacing: (u64, u64),
    /// Worker pool limits.
    pub pool: PoolConfig,
}

impl Config {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: network.default_port(),
            min_outbound_peers: DEFAULT_MIN_OUTBOUND_PEERS,
            max_peers: DEFAULT_MAX_PEERS,
            initial_peers: Vec::new(),
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            broadcast_spacing: (20, 40),
            pool: PoolConfig::default(),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.listen_port)
    }

    pub fn max_message_size(&self) -> u32 {
        max_message_size(self.max_block_size)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Network::Mainnet)
    }
}
