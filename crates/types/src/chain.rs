//! Chain-level data carried over the wire. The networking core treats
//! these as opaque payloads supplied and consumed by the controller.

/// Signature length used by HEIGHT_V2 frames.
pub const BLOCK_SIGNATURE_LENGTH: usize = 64;
/// Minter public key length used by HEIGHT_V2 frames.
pub const MINTER_KEY_LENGTH: usize = 32;

/// A compact description of a chain tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub height: u64,
    /// Block signature; [`BLOCK_SIGNATURE_LENGTH`] bytes.
    pub signature: Vec<u8>,
    /// Block timestamp, milliseconds since epoch.
    pub timestamp: u64,
    /// Minter public key; [`MINTER_KEY_LENGTH`] bytes.
    pub minter_public_key: Vec<u8>,
}

/// An account currently minting, as announced between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineAccountData {
    pub timestamp: u64,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}
