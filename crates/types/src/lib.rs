//! Core types shared by the quill node: network selection, peer
//! addressing, the wire message model and its frame codec.

pub mod address;
pub mod chain;
pub mod messages;
pub mod network;
pub mod node_id;

pub use address::PeerAddress;
pub use chain::{BlockSummary, OnlineAccountData};
pub use network::Network;
pub use node_id::NodeId;
