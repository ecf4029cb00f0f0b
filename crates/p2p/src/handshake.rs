//! The per-connection handshake state machine.
//!
//! Each transition is a function over the handshake record and the
//! received message; it never touches sockets or shared state. Side
//! effects are returned as [`Action`]s for the network manager to
//! perform. The outbound side drives every stage (sends before
//! waiting); the inbound side mirrors, which keeps the exchange from
//! crossing out of order.

use bitcoin_hashes::{sha256, Hash, HashEngine};
use thiserror::Error;

use quill_types::messages::{MessageType, NetworkMessage, CODE_LENGTH};
use quill_types::NodeId;

use crate::net::Link;

/// Highest protocol version this node speaks.
pub const PROTOCOL_VERSION: u32 = 2;
/// Lowest protocol version still accepted.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Progress of a connection through the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    Started,
    Version,
    PeerId,
    Proof,
    PeerVerify,
    Completed,
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::Version => "version",
            Self::PeerId => "peer-id",
            Self::Proof => "proof",
            Self::PeerVerify => "peer-verify",
            Self::Completed => "completed",
        };
        write!(f, "{name}")
    }
}

/// A handshake rule violation. Always answered with a silent
/// disconnect, never with a structured reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unexpected {got:?} message in `{state}` state")]
    Unexpected {
        state: HandshakeState,
        got: MessageType,
    },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("peer identity proof mismatch")]
    ProofMismatch,
    #[error("verification code mismatch")]
    CodeMismatch,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send this payload to the peer.
    Send(NetworkMessage),
    /// The handshake reached `Completed`.
    Completed,
    /// The remote presented our own node id.
    SelfConnect,
    /// An inbound connection already claims `claimed`: generate
    /// verification codes and challenge over this channel.
    BeginVerify { claimed: NodeId },
    /// The remote challenged our identity; echo `code` over our
    /// outbound connection carrying the same node id.
    Prove { claimed: NodeId, code: [u8; CODE_LENGTH] },
}

/// Per-connection handshake record.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub state: HandshakeState,
    /// The version the remote announced, raw.
    pub remote_version: u32,
    /// The remote's node id, once accepted.
    pub remote_id: Option<NodeId>,
    /// A claimed id held back until doppelganger verification resolves.
    pub pending_id: Option<NodeId>,
    /// Code the counterparty must echo over the other channel.
    pub verification_sent: Option<[u8; CODE_LENGTH]>,
    /// Code we expect to see on this channel to close verification.
    pub verification_expected: Option<[u8; CODE_LENGTH]>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Started,
            remote_version: 0,
            remote_id: None,
            pending_id: None,
            verification_sent: None,
            verification_expected: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == HandshakeState::Completed
    }

    /// The protocol version both sides speak.
    pub fn negotiated_version(&self) -> u32 {
        self.remote_version.min(PROTOCOL_VERSION)
    }
}

/// Immutable inputs to a transition.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub our_id: &'a NodeId,
    pub direction: Link,
    /// Set when another *inbound* connection already claims the id
    /// carried by the message being handled.
    pub duplicate_inbound: bool,
}

/// Start the handshake on a fresh connection. The outbound side opens
/// with its VERSION; the inbound side waits.
pub fn initiate(hs: &mut Handshake, direction: Link) -> Vec<Action> {
    match direction {
        Link::Outbound => {
            hs.state = HandshakeState::Version;
            vec![Action::Send(NetworkMessage::Version(PROTOCOL_VERSION))]
        }
        Link::Inbound => {
            hs.state = HandshakeState::Started;
            vec![]
        }
    }
}

/// Apply one received message to the handshake.
pub fn transition(
    hs: &mut Handshake,
    msg: &NetworkMessage,
    ctx: &Context,
) -> Result<Vec<Action>, HandshakeError> {
    use HandshakeState::*;

    match (hs.state, msg) {
        // Inbound mirror of the opening VERSION.
        (Started, NetworkMessage::Version(version)) if ctx.direction.is_inbound() => {
            check_version(*version)?;
            hs.remote_version = *version;
            hs.state = Version;
            Ok(vec![Action::Send(NetworkMessage::Version(PROTOCOL_VERSION))])
        }

        // Outbound heard the mirrored VERSION; announce our id.
        (Version, NetworkMessage::Version(version)) if ctx.direction.is_outbound() => {
            check_version(*version)?;
            hs.remote_version = *version;
            hs.state = PeerId;
            Ok(vec![Action::Send(NetworkMessage::PeerId(*ctx.our_id))])
        }

        // Inbound receives the driver's id, answers with its own.
        (Version, NetworkMessage::PeerId(id)) if ctx.direction.is_inbound() => {
            if id == ctx.our_id {
                return Ok(vec![Action::SelfConnect]);
            }
            hs.remote_id = Some(*id);
            hs.state = Proof;
            Ok(vec![Action::Send(NetworkMessage::PeerId(*ctx.our_id))])
        }

        // Outbound receives the mirrored id; prove or verify.
        (PeerId, NetworkMessage::PeerId(id)) if ctx.direction.is_outbound() => {
            if id == ctx.our_id {
                return Ok(vec![Action::SelfConnect]);
            }
            if ctx.duplicate_inbound {
                // The identity is ambiguous; hold the id until the
                // challenge resolves.
                hs.pending_id = Some(*id);
                hs.state = PeerVerify;
                return Ok(vec![Action::BeginVerify { claimed: *id }]);
            }
            hs.remote_id = Some(*id);
            hs.state = Proof;
            Ok(vec![Action::Send(NetworkMessage::Proof(proof_digest(
                ctx.our_id, id,
            )))])
        }

        // The driver's proof arrives; verify, answer, complete.
        (Proof, NetworkMessage::Proof(digest)) => {
            let remote = hs.remote_id.expect("remote id recorded before proof stage");
            if *digest != proof_digest(&remote, ctx.our_id) {
                return Err(HandshakeError::ProofMismatch);
            }
            hs.state = Completed;
            match ctx.direction {
                Link::Inbound => Ok(vec![
                    Action::Send(NetworkMessage::Proof(proof_digest(ctx.our_id, &remote))),
                    Action::Completed,
                ]),
                Link::Outbound => Ok(vec![Action::Completed]),
            }
        }

        // The remote challenged our identity instead of proving; this
        // only arrives over the challenger's outbound leg, ie. our
        // inbound one.
        (Proof, NetworkMessage::VerificationCodes { send, expect })
            if ctx.direction.is_inbound() =>
        {
            let claimed = hs.remote_id.expect("remote id recorded before proof stage");
            hs.verification_sent = Some(*send);
            hs.verification_expected = Some(*expect);
            hs.state = PeerVerify;
            Ok(vec![Action::Prove {
                claimed,
                code: *send,
            }])
        }

        // The challenger confirmed our proof on this channel.
        (PeerVerify, NetworkMessage::PeerVerify(code)) => {
            if hs.verification_expected != Some(*code) {
                return Err(HandshakeError::CodeMismatch);
            }
            if let Some(id) = hs.pending_id.take() {
                hs.remote_id = Some(id);
            }
            hs.state = Completed;
            Ok(vec![Action::Completed])
        }

        (state, msg) => Err(HandshakeError::Unexpected {
            state,
            got: msg.kind(),
        }),
    }
}

fn check_version(version: u32) -> Result<(), HandshakeError> {
    if version < MIN_PROTOCOL_VERSION {
        return Err(HandshakeError::UnsupportedVersion(version));
    }
    Ok(())
}

/// The proof digest `sender` presents to `receiver`: SHA-256 over the
/// two node ids in sending order. Each side can recompute both
/// directions, so the digest shows knowledge of the full id exchange.
pub fn proof_digest(sender: &NodeId, receiver: &NodeId) -> [u8; CODE_LENGTH] {
    let mut engine = sha256::Hash::engine();
    engine.input(sender.as_bytes());
    engine.input(receiver.as_bytes());
    sha256::Hash::from_engine(engine).into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn node_id(fill: u8) -> NodeId {
        NodeId::from_random_bytes([fill; 128])
    }

    struct Side {
        hs: Handshake,
        ctx_id: NodeId,
        direction: Link,
        completed: bool,
    }

    impl Side {
        fn new(id: NodeId, direction: Link) -> Self {
            Self {
                hs: Handshake::new(),
                ctx_id: id,
                direction,
                completed: false,
            }
        }

        fn handle(&mut self, msg: &NetworkMessage) -> Vec<NetworkMessage> {
            let ctx = Context {
                our_id: &self.ctx_id,
                direction: self.direction,
                duplicate_inbound: false,
            };
            let mut sent = Vec::new();
            for action in transition(&mut self.hs, msg, &ctx).unwrap() {
                match action {
                    Action::Send(out) => sent.push(out),
                    Action::Completed => self.completed = true,
                    other => panic!("unexpected action {other:?}"),
                }
            }
            sent
        }
    }

    #[test]
    fn both_sides_complete_a_clean_handshake() {
        let mut dialer = Side::new(node_id(0xAA), Link::Outbound);
        let mut listener = Side::new(node_id(0xBB), Link::Inbound);

        let mut to_listener: VecDeque<_> = initiate(&mut dialer.hs, Link::Outbound)
            .into_iter()
            .map(|a| match a {
                Action::Send(msg) => msg,
                other => panic!("unexpected action {other:?}"),
            })
            .collect();
        initiate(&mut listener.hs, Link::Inbound);
        let mut to_dialer = VecDeque::new();

        while !(dialer.completed && listener.completed) {
            if let Some(msg) = to_listener.pop_front() {
                to_dialer.extend(listener.handle(&msg));
            } else if let Some(msg) = to_dialer.pop_front() {
                to_listener.extend(dialer.handle(&msg));
            } else {
                panic!("handshake stalled");
            }
        }

        assert_eq!(dialer.hs.remote_id, Some(node_id(0xBB)));
        assert_eq!(listener.hs.remote_id, Some(node_id(0xAA)));
        assert_eq!(dialer.hs.negotiated_version(), PROTOCOL_VERSION);
        assert_eq!(listener.hs.negotiated_version(), PROTOCOL_VERSION);
    }

    #[test]
    fn negotiates_down_to_the_older_version() {
        let our = node_id(0xAA);
        let mut hs = Handshake::new();
        initiate(&mut hs, Link::Outbound);

        let ctx = Context {
            our_id: &our,
            direction: Link::Outbound,
            duplicate_inbound: false,
        };
        transition(&mut hs, &NetworkMessage::Version(1), &ctx).unwrap();
        assert_eq!(hs.negotiated_version(), 1);
    }

    #[test]
    fn rejects_an_unsupported_version() {
        let our = node_id(0xAA);
        let mut hs = Handshake::new();
        let ctx = Context {
            our_id: &our,
            direction: Link::Inbound,
            duplicate_inbound: false,
        };
        assert_eq!(
            transition(&mut hs, &NetworkMessage::Version(0), &ctx),
            Err(HandshakeError::UnsupportedVersion(0))
        );
    }

    #[test]
    fn detects_a_connection_to_ourselves() {
        let our = node_id(0xAA);
        let mut hs = Handshake::new();
        initiate(&mut hs, Link::Outbound);

        let ctx = Context {
            our_id: &our,
            direction: Link::Outbound,
            duplicate_inbound: false,
        };
        transition(&mut hs, &NetworkMessage::Version(PROTOCOL_VERSION), &ctx).unwrap();
        let actions = transition(&mut hs, &NetworkMessage::PeerId(our), &ctx).unwrap();

        assert_eq!(actions, vec![Action::SelfConnect]);
        assert!(!hs.is_completed());
    }

    #[test]
    fn duplicate_claimed_id_raises_verification() {
        let our = node_id(0xAA);
        let claimed = node_id(0xCC);
        let mut hs = Handshake::new();
        initiate(&mut hs, Link::Outbound);

        let ctx = Context {
            our_id: &our,
            direction: Link::Outbound,
            duplicate_inbound: false,
        };
        transition(&mut hs, &NetworkMessage::Version(PROTOCOL_VERSION), &ctx).unwrap();

        let ctx = Context {
            duplicate_inbound: true,
            ..ctx
        };
        let actions = transition(&mut hs, &NetworkMessage::PeerId(claimed), &ctx).unwrap();

        assert_eq!(actions, vec![Action::BeginVerify { claimed }]);
        assert_eq!(hs.state, HandshakeState::PeerVerify);
        assert_eq!(hs.pending_id, Some(claimed));
        assert_eq!(hs.remote_id, None);
    }

    #[test]
    fn challenged_inbound_proves_over_the_other_channel() {
        let our = node_id(0xBB);
        let remote = node_id(0xCC);
        let mut hs = Handshake::new();
        initiate(&mut hs, Link::Inbound);

        let ctx = Context {
            our_id: &our,
            direction: Link::Inbound,
            duplicate_inbound: false,
        };
        transition(&mut hs, &NetworkMessage::Version(PROTOCOL_VERSION), &ctx).unwrap();
        transition(&mut hs, &NetworkMessage::PeerId(remote), &ctx).unwrap();

        let send = [0x01; CODE_LENGTH];
        let expect = [0x02; CODE_LENGTH];
        let actions = transition(
            &mut hs,
            &NetworkMessage::VerificationCodes { send, expect },
            &ctx,
        )
        .unwrap();

        assert_eq!(
            actions,
            vec![Action::Prove {
                claimed: remote,
                code: send
            }]
        );
        assert_eq!(hs.state, HandshakeState::PeerVerify);

        // The matching confirmation completes the channel…
        let actions =
            transition(&mut hs, &NetworkMessage::PeerVerify(expect), &ctx).unwrap();
        assert_eq!(actions, vec![Action::Completed]);
        assert!(hs.is_completed());
    }

    #[test]
    fn wrong_verification_code_is_fatal() {
        let our = node_id(0xBB);
        let remote = node_id(0xCC);
        let mut hs = Handshake::new();
        let ctx = Context {
            our_id: &our,
            direction: Link::Inbound,
            duplicate_inbound: false,
        };
        transition(&mut hs, &NetworkMessage::Version(PROTOCOL_VERSION), &ctx).unwrap();
        transition(&mut hs, &NetworkMessage::PeerId(remote), &ctx).unwrap();
        transition(
            &mut hs,
            &NetworkMessage::VerificationCodes {
                send: [0x01; CODE_LENGTH],
                expect: [0x02; CODE_LENGTH],
            },
            &ctx,
        )
        .unwrap();

        assert_eq!(
            transition(&mut hs, &NetworkMessage::PeerVerify([0x03; CODE_LENGTH]), &ctx),
            Err(HandshakeError::CodeMismatch)
        );
    }

    #[test]
    fn a_bad_proof_is_fatal() {
        let our = node_id(0xAA);
        let remote = node_id(0xBB);
        let mut hs = Handshake::new();
        initiate(&mut hs, Link::Outbound);

        let ctx = Context {
            our_id: &our,
            direction: Link::Outbound,
            duplicate_inbound: false,
        };
        transition(&mut hs, &NetworkMessage::Version(PROTOCOL_VERSION), &ctx).unwrap();
        transition(&mut hs, &NetworkMessage::PeerId(remote), &ctx).unwrap();

        assert_eq!(
            transition(&mut hs, &NetworkMessage::Proof([0u8; CODE_LENGTH]), &ctx),
            Err(HandshakeError::ProofMismatch)
        );
    }

    #[test]
    fn out_of_order_messages_are_rejected() {
        let our = node_id(0xAA);
        let mut hs = Handshake::new();
        let ctx = Context {
            our_id: &our,
            direction: Link::Inbound,
            duplicate_inbound: false,
        };

        // PEER_ID before VERSION.
        assert!(matches!(
            transition(&mut hs, &NetworkMessage::PeerId(node_id(0xBB)), &ctx),
            Err(HandshakeError::Unexpected {
                state: HandshakeState::Started,
                got: MessageType::PeerId,
            })
        ));

        // General-purpose traffic before the handshake is done.
        assert!(matches!(
            transition(&mut hs, &NetworkMessage::Height(5), &ctx),
            Err(HandshakeError::Unexpected { .. })
        ));
    }
}
