//! Peer network selection. Eg. *Mainnet*.

use serde::{Deserialize, Serialize};

/// Network magic carried in every wire frame.
pub type Magic = [u8; 4];

/// The chain a node participates in. Mainnet and testnet frames are
/// distinguished by their magic so the two populations never mix.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    /// Frame magic for this network.
    pub fn magic(&self) -> Magic {
        match self {
            Network::Mainnet => [0x51, 0x4f, 0x52, 0x54],
            Network::Testnet => [0x71, 0x6f, 0x72, 0x54],
        }
    }

    /// Port assumed for peer addresses that don't carry one.
    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 12392,
            Network::Testnet => 62392,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
        }
    }
}
