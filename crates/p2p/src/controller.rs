//! The controller consumed by the networking core.

use std::sync::Arc;

use quill_types::messages::RawNetworkMessage;
use quill_types::{BlockSummary, OnlineAccountData};

use crate::network::Broadcast;
use crate::peer::Peer;

/// Higher-level node logic the networking core reports into.
///
/// Handshake and transport concerns never reach the controller; it sees
/// peers only once they are fully handshaked, and messages only of the
/// kinds the core does not serve itself.
pub trait Controller: Send + Sync + 'static {
    /// A peer finished its handshake and general-purpose messages flow.
    fn on_peer_handshake_completed(&self, peer: &Arc<Peer>);

    /// A peer was disconnected, for any reason.
    fn on_peer_disconnect(&self, peer: &Arc<Peer>);

    /// A message the core passes through: chain data, transactions and
    /// opaque controller-level types.
    fn on_network_message(&self, peer: &Arc<Peer>, msg: RawNetworkMessage);

    /// The periodic broadcast window opened; emit whatever is due via
    /// `network`.
    fn do_network_broadcast(&self, network: &dyn Broadcast);

    /// Our best block, advertised to peers completing their handshake.
    fn get_chain_tip(&self) -> BlockSummary;

    /// Accounts currently minting on this node.
    fn get_online_accounts(&self) -> Vec<OnlineAccountData>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Controller {}

    impl Controller for Controller {
        fn on_peer_handshake_completed(&self, peer: &Arc<Peer>);
        fn on_peer_disconnect(&self, peer: &Arc<Peer>);
        fn on_network_message(&self, peer: &Arc<Peer>, msg: RawNetworkMessage);
        fn do_network_broadcast(&self, network: &dyn Broadcast);
        fn get_chain_tip(&self) -> BlockSummary;
        fn get_online_accounts(&self) -> Vec<OnlineAccountData>;
    }
}
