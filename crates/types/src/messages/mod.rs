//! Typed wire messages exchanged between peers.

use crate::address::PeerAddress;
use crate::chain::BlockSummary;
use crate::node_id::NodeId;

mod codec;

pub use codec::{encode, max_message_size, Decoder, Error, DEFAULT_MAX_BLOCK_SIZE};

/// Length of a verification code or proof digest.
pub const CODE_LENGTH: usize = 32;
/// Length of a transaction signature.
pub const TRANSACTION_SIGNATURE_LENGTH: usize = 64;

/// Wire message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Ping = 1,
    GetPeers = 2,
    Peers = 3,
    Height = 4,
    Version = 5,
    PeerId = 6,
    Proof = 7,
    PeersV2 = 8,
    HeightV2 = 9,
    Transaction = 10,
    TransactionSignatures = 11,
    GetUnconfirmedTransactions = 12,
    PeerVerify = 13,
    VerificationCodes = 14,

    // Controller-level types; the codec carries their payloads opaquely.
    Block = 20,
    GetBlock = 21,
    BlockSummaries = 22,
    GetBlockSummaries = 23,
    Signatures = 24,
    GetSignatures = 25,
}

impl MessageType {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        use MessageType::*;
        Some(match code {
            1 => Ping,
            2 => GetPeers,
            3 => Peers,
            4 => Height,
            5 => Version,
            6 => PeerId,
            7 => Proof,
            8 => PeersV2,
            9 => HeightV2,
            10 => Transaction,
            11 => TransactionSignatures,
            12 => GetUnconfirmedTransactions,
            13 => PeerVerify,
            14 => VerificationCodes,
            20 => Block,
            21 => GetBlock,
            22 => BlockSummaries,
            23 => GetBlockSummaries,
            24 => Signatures,
            25 => GetSignatures,
            _ => return None,
        })
    }

    /// Whether the payload is passed through to the controller
    /// without interpretation.
    pub fn is_opaque(self) -> bool {
        self.code() >= 20
    }
}

/// Message payloads understood by the networking core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    /// Keep-alive. A reply is a `Ping` echoing the request id.
    Ping,
    /// Ask a peer for addresses it knows.
    GetPeers,
    /// Known peers, v1 format: IPv4 only, implied default port.
    Peers(Vec<std::net::Ipv4Addr>),
    /// Known peers, v2 format: host plus explicit port.
    PeersV2(Vec<PeerAddress>),
    /// Chain tip height, v1 format.
    Height(u64),
    /// Chain tip summary, v2 format.
    HeightV2(BlockSummary),
    /// Protocol version announcement; the first handshake message.
    Version(u32),
    /// The sender's session node id.
    PeerId(NodeId),
    /// Identity digest closing the handshake.
    Proof([u8; CODE_LENGTH]),
    /// A full transaction body (v1 push model).
    Transaction(Vec<u8>),
    /// Transaction signatures for the v2 pull model.
    TransactionSignatures(Vec<Vec<u8>>),
    /// Ask a peer for its unconfirmed transaction signatures.
    GetUnconfirmedTransactions,
    /// Echo of a verification code, proving channel ownership.
    PeerVerify([u8; CODE_LENGTH]),
    /// Challenge codes opening doppelganger verification.
    VerificationCodes {
        send: [u8; CODE_LENGTH],
        expect: [u8; CODE_LENGTH],
    },
    /// A controller-level message the core does not interpret.
    Opaque { kind: MessageType, payload: Vec<u8> },
}

impl NetworkMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Ping => MessageType::Ping,
            Self::GetPeers => MessageType::GetPeers,
            Self::Peers(_) => MessageType::Peers,
            Self::PeersV2(_) => MessageType::PeersV2,
            Self::Height(_) => MessageType::Height,
            Self::HeightV2(_) => MessageType::HeightV2,
            Self::Version(_) => MessageType::Version,
            Self::PeerId(_) => MessageType::PeerId,
            Self::Proof(_) => MessageType::Proof,
            Self::Transaction(_) => MessageType::Transaction,
            Self::TransactionSignatures(_) => MessageType::TransactionSignatures,
            Self::GetUnconfirmedTransactions => MessageType::GetUnconfirmedTransactions,
            Self::PeerVerify(_) => MessageType::PeerVerify,
            Self::VerificationCodes { .. } => MessageType::VerificationCodes,
            Self::Opaque { kind, .. } => *kind,
        }
    }
}

/// A framed message: correlation id plus payload.
///
/// Id `0` means no reply is expected; a reply carries the id of the
/// request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNetworkMessage {
    pub id: i32,
    pub payload: NetworkMessage,
}

impl RawNetworkMessage {
    pub fn new(id: i32, payload: NetworkMessage) -> Self {
        Self { id, payload }
    }

    /// A message that expects no reply.
    pub fn unsolicited(payload: NetworkMessage) -> Self {
        Self { id: 0, payload }
    }

    /// A reply to `request`, carrying its id.
    pub fn reply_to(request_id: i32, payload: NetworkMessage) -> Self {
        Self {
            id: request_id,
            payload,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }
}
