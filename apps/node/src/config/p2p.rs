use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use quill_p2p::config::{DEFAULT_MAX_PEERS, DEFAULT_MIN_OUTBOUND_PEERS};
use quill_types::network::Network;

#[derive(Serialize, Deserialize, Clone)]
pub struct P2pConfig {
    /// Address to listen on for incoming connections.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Listen port; the network's default port when absent.
    #[serde(default)]
    pub port: Option<u16>,
    /// Keep dialing until this many outbound connections are up.
    #[serde(default = "default_min_outbound_peers")]
    pub min_outbound_peers: usize,
    /// Cap on simultaneous connections.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Peers seeded into an empty repository.
    #[serde(default)]
    pub initial_peers: Vec<String>,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_min_outbound_peers() -> usize {
    DEFAULT_MIN_OUTBOUND_PEERS
}

fn default_max_peers() -> usize {
    DEFAULT_MAX_PEERS
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: None,
            min_outbound_peers: default_min_outbound_peers(),
            max_peers: default_max_peers(),
            initial_peers: Vec::new(),
        }
    }
}

impl P2pConfig {
    pub fn to_core_config(&self, network: Network) -> quill_p2p::Config {
        let mut config = quill_p2p::Config::new(network);
        config.bind_address = self.bind_address;
        config.listen_port = self.port.unwrap_or_else(|| network.default_port());
        config.min_outbound_peers = self.min_outbound_peers;
        config.max_peers = self.max_peers;
        config.initial_peers = self.initial_peers.clone();
        config
    }
}
