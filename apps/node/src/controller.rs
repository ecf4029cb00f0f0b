//! Node-side controller wiring for the networking core.
//!
//! The full chain logic lives elsewhere; this controller keeps the best
//! tip peers have announced and re-advertises ours on each broadcast
//! window.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use quill_p2p::controller::Controller;
use quill_p2p::network::Broadcast;
use quill_p2p::peer::Peer;
use quill_types::messages::{NetworkMessage, RawNetworkMessage};
use quill_types::{BlockSummary, OnlineAccountData};

pub struct NodeController {
    tip: Mutex<BlockSummary>,
    /// Highest height any peer has announced.
    best_seen: Mutex<u64>,
}

impl NodeController {
    pub fn new() -> Self {
        Self {
            tip: Mutex::new(genesis_summary()),
            best_seen: Mutex::new(0),
        }
    }

    fn record_height(&self, peer: &Arc<Peer>, height: u64) {
        let mut best = self.best_seen.lock().expect("controller lock is never poisoned");
        if height > *best {
            info!("{}: New best peer height {}", peer.address(), height);
            *best = height;
        }
    }
}

fn genesis_summary() -> BlockSummary {
    BlockSummary {
        height: 1,
        signature: vec![0; 64],
        timestamp: 0,
        minter_public_key: vec![0; 32],
    }
}

impl Controller for NodeController {
    fn on_peer_handshake_completed(&self, peer: &Arc<Peer>) {
        info!("{}: Peer handshaked ({})", peer.address(), peer.direction());
    }

    fn on_peer_disconnect(&self, peer: &Arc<Peer>) {
        debug!("{}: Peer disconnected", peer.address());
    }

    fn on_network_message(&self, peer: &Arc<Peer>, msg: RawNetworkMessage) {
        match msg.payload {
            NetworkMessage::Height(height) => self.record_height(peer, height),
            NetworkMessage::HeightV2(summary) => self.record_height(peer, summary.height),
            other => {
                debug!("{}: Ignoring {:?} message", peer.address(), other.kind());
            }
        }
    }

    fn do_network_broadcast(&self, network: &dyn Broadcast) {
        let tip = self.get_chain_tip();
        network.broadcast(Box::new(move |peer| {
            let payload = if peer.version() >= 2 {
                NetworkMessage::HeightV2(tip.clone())
            } else {
                NetworkMessage::Height(tip.height)
            };
            Some(RawNetworkMessage::unsolicited(payload))
        }));
    }

    fn get_chain_tip(&self) -> BlockSummary {
        self.tip.lock().expect("controller lock is never poisoned").clone()
    }

    fn get_online_accounts(&self) -> Vec<OnlineAccountData> {
        Vec::new()
    }
}
