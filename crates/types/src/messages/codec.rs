//! Frame codec.
//!
//! Every frame is `magic(4) | type(4) | id(4) | length(4)` followed, when
//! `length > 0`, by a 4-byte checksum (the first bytes of SHA-256 over the
//! payload) and the payload itself. All integers are big-endian.

use std::net::Ipv4Addr;

use bitcoin_hashes::{sha256, Hash};
use thiserror::Error;

use crate::address::PeerAddress;
use crate::chain::{BlockSummary, BLOCK_SIGNATURE_LENGTH, MINTER_KEY_LENGTH};
use crate::messages::{
    MessageType, NetworkMessage, RawNetworkMessage, CODE_LENGTH, TRANSACTION_SIGNATURE_LENGTH,
};
use crate::network::Magic;
use crate::node_id::{NodeId, NODE_ID_LENGTH};

/// Fixed part of every frame: magic, type, id, length.
const HEADER_LENGTH: usize = 16;
/// Checksum field size, present only when the payload is non-empty.
const CHECKSUM_LENGTH: usize = 4;

/// Default cap on the size of a single block, which bounds frames.
pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// Largest payload a frame may carry: a block message is the biggest
/// legitimate frame (type tag, flag byte, length word, block body).
pub const fn max_message_size(max_block_size: u32) -> u32 {
    4 + 1 + 4 + max_block_size
}

/// A codec failure. Short reads are not represented here: the
/// [`Decoder`] buffers partial frames and resumes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unknown message type code {0}")]
    UnknownType(u32),
    #[error("frame length {length} exceeds maximum {max}")]
    Oversize { length: u32, max: u32 },
    #[error("payload checksum mismatch")]
    BadChecksum,
    #[error("malformed {0:?} payload")]
    BadPayload(MessageType),
    #[error("failed to encode {0:?} message")]
    Encode(MessageType),
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LENGTH] {
    let digest = sha256::Hash::hash(payload).into_inner();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Encode a message into a complete frame. Encoding never depends on
/// connection state.
pub fn encode(magic: Magic, msg: &RawNetworkMessage) -> Result<Vec<u8>, Error> {
    let payload = encode_payload(&msg.payload)?;

    let mut frame = Vec::with_capacity(HEADER_LENGTH + CHECKSUM_LENGTH + payload.len());
    frame.extend_from_slice(&magic);
    frame.extend_from_slice(&msg.kind().code().to_be_bytes());
    frame.extend_from_slice(&msg.id.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    if !payload.is_empty() {
        frame.extend_from_slice(&checksum(&payload));
        frame.extend_from_slice(&payload);
    }
    Ok(frame)
}

/// Message stream decoder.
///
/// Buffers raw bytes and yields complete messages; a frame split across
/// arbitrary read boundaries decodes once its last byte arrives.
#[derive(Debug)]
pub struct Decoder {
    magic: Magic,
    max_size: u32,
    unparsed: Vec<u8>,
}

impl Decoder {
    pub fn new(magic: Magic, max_size: u32, capacity: usize) -> Self {
        Self {
            magic,
            max_size,
            unparsed: Vec::with_capacity(capacity),
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next message. Returns `None` when more
    /// bytes are needed.
    pub fn decode_next(&mut self) -> Result<Option<RawNetworkMessage>, Error> {
        if self.unparsed.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let magic: [u8; 4] = self.unparsed[0..4].try_into().expect("slice length is 4");
        if magic != self.magic {
            return Err(Error::BadMagic(magic));
        }

        let code = u32::from_be_bytes(self.unparsed[4..8].try_into().expect("slice length is 4"));
        let kind = MessageType::from_code(code).ok_or(Error::UnknownType(code))?;

        let id = i32::from_be_bytes(self.unparsed[8..12].try_into().expect("slice length is 4"));

        let length =
            u32::from_be_bytes(self.unparsed[12..16].try_into().expect("slice length is 4"));
        // Reject before waiting for (or allocating) an absurd payload.
        if length > self.max_size {
            return Err(Error::Oversize {
                length,
                max: self.max_size,
            });
        }

        let payload = if length == 0 {
            decode_payload(kind, &[])?
        } else {
            let frame_len = HEADER_LENGTH + CHECKSUM_LENGTH + length as usize;
            if self.unparsed.len() < frame_len {
                return Ok(None);
            }
            let expected: [u8; 4] = self.unparsed[16..20].try_into().expect("slice length is 4");
            let body = &self.unparsed[20..frame_len];
            if checksum(body) != expected {
                return Err(Error::BadChecksum);
            }
            decode_payload(kind, body)?
        };

        let frame_len = if length == 0 {
            HEADER_LENGTH
        } else {
            HEADER_LENGTH + CHECKSUM_LENGTH + length as usize
        };
        self.unparsed.drain(..frame_len);

        Ok(Some(RawNetworkMessage { id, payload }))
    }
}

fn encode_payload(payload: &NetworkMessage) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();

    match payload {
        NetworkMessage::Ping
        | NetworkMessage::GetPeers
        | NetworkMessage::GetUnconfirmedTransactions => {}
        NetworkMessage::Peers(addrs) => {
            buf.extend_from_slice(&(addrs.len() as u32).to_be_bytes());
            for ip in addrs {
                buf.extend_from_slice(&ip.octets());
            }
        }
        NetworkMessage::PeersV2(addrs) => {
            buf.extend_from_slice(&(addrs.len() as u32).to_be_bytes());
            for addr in addrs {
                let host = addr.host().as_bytes();
                if host.is_empty() || host.len() > u8::MAX as usize {
                    return Err(Error::Encode(MessageType::PeersV2));
                }
                buf.push(host.len() as u8);
                buf.extend_from_slice(host);
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
        }
        NetworkMessage::Height(height) => buf.extend_from_slice(&height.to_be_bytes()),
        NetworkMessage::HeightV2(summary) => {
            if summary.signature.len() != BLOCK_SIGNATURE_LENGTH
                || summary.minter_public_key.len() != MINTER_KEY_LENGTH
            {
                return Err(Error::Encode(MessageType::HeightV2));
            }
            buf.extend_from_slice(&summary.height.to_be_bytes());
            buf.extend_from_slice(&summary.signature);
            buf.extend_from_slice(&summary.timestamp.to_be_bytes());
            buf.extend_from_slice(&summary.minter_public_key);
        }
        NetworkMessage::Version(version) => buf.extend_from_slice(&version.to_be_bytes()),
        NetworkMessage::PeerId(id) => buf.extend_from_slice(id.as_bytes()),
        NetworkMessage::Proof(digest) => buf.extend_from_slice(digest),
        NetworkMessage::PeerVerify(code) => buf.extend_from_slice(code),
        NetworkMessage::VerificationCodes { send, expect } => {
            buf.extend_from_slice(send);
            buf.extend_from_slice(expect);
        }
        NetworkMessage::Transaction(bytes) => buf.extend_from_slice(bytes),
        NetworkMessage::TransactionSignatures(sigs) => {
            buf.extend_from_slice(&(sigs.len() as u32).to_be_bytes());
            for sig in sigs {
                if sig.len() != TRANSACTION_SIGNATURE_LENGTH {
                    return Err(Error::Encode(MessageType::TransactionSignatures));
                }
                buf.extend_from_slice(sig);
            }
        }
        NetworkMessage::Opaque { payload, .. } => buf.extend_from_slice(payload),
    }

    Ok(buf)
}

fn decode_payload(kind: MessageType, body: &[u8]) -> Result<NetworkMessage, Error> {
    let mut r = Reader::new(kind, body);

    let payload = match kind {
        MessageType::Ping => NetworkMessage::Ping,
        MessageType::GetPeers => NetworkMessage::GetPeers,
        MessageType::GetUnconfirmedTransactions => NetworkMessage::GetUnconfirmedTransactions,
        MessageType::Peers => {
            let count = r.u32()?;
            let mut addrs = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                let octets: [u8; 4] = r.take(4)?.try_into().expect("slice length is 4");
                addrs.push(Ipv4Addr::from(octets));
            }
            NetworkMessage::Peers(addrs)
        }
        MessageType::PeersV2 => {
            let count = r.u32()?;
            let mut addrs = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                let len = r.u8()? as usize;
                let host = std::str::from_utf8(r.take(len)?)
                    .map_err(|_| Error::BadPayload(kind))?
                    .to_owned();
                let port = r.u16()?;
                addrs.push(PeerAddress::new(host, port).map_err(|_| Error::BadPayload(kind))?);
            }
            NetworkMessage::PeersV2(addrs)
        }
        MessageType::Height => NetworkMessage::Height(r.u64()?),
        MessageType::HeightV2 => {
            let height = r.u64()?;
            let signature = r.take(BLOCK_SIGNATURE_LENGTH)?.to_vec();
            let timestamp = r.u64()?;
            let minter_public_key = r.take(MINTER_KEY_LENGTH)?.to_vec();
            NetworkMessage::HeightV2(BlockSummary {
                height,
                signature,
                timestamp,
                minter_public_key,
            })
        }
        MessageType::Version => NetworkMessage::Version(r.u32()?),
        MessageType::PeerId => {
            let bytes: [u8; NODE_ID_LENGTH] = r
                .take(NODE_ID_LENGTH)?
                .try_into()
                .expect("slice length matches");
            NetworkMessage::PeerId(NodeId::from_bytes(bytes))
        }
        MessageType::Proof => NetworkMessage::Proof(r.code()?),
        MessageType::PeerVerify => NetworkMessage::PeerVerify(r.code()?),
        MessageType::VerificationCodes => NetworkMessage::VerificationCodes {
            send: r.code()?,
            expect: r.code()?,
        },
        MessageType::Transaction => return Ok(NetworkMessage::Transaction(body.to_vec())),
        MessageType::TransactionSignatures => {
            let count = r.u32()?;
            let mut sigs = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                sigs.push(r.take(TRANSACTION_SIGNATURE_LENGTH)?.to_vec());
            }
            NetworkMessage::TransactionSignatures(sigs)
        }
        kind if kind.is_opaque() => {
            return Ok(NetworkMessage::Opaque {
                kind,
                payload: body.to_vec(),
            })
        }
        _ => unreachable!("all message types are covered"),
    };

    r.finish()?;
    Ok(payload)
}

/// Cursor over a payload body; any out-of-bounds read or trailing
/// garbage is a `BadPayload`.
struct Reader<'a> {
    kind: MessageType,
    body: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(kind: MessageType, body: &'a [u8]) -> Self {
        Self { kind, body, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.body.len())
            .ok_or(Error::BadPayload(self.kind))?;
        let slice = &self.body[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(
            self.take(2)?.try_into().expect("slice length is 2"),
        ))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(
            self.take(4)?.try_into().expect("slice length is 4"),
        ))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_be_bytes(
            self.take(8)?.try_into().expect("slice length is 8"),
        ))
    }

    fn code(&mut self) -> Result<[u8; CODE_LENGTH], Error> {
        Ok(self
            .take(CODE_LENGTH)?
            .try_into()
            .expect("slice length matches"))
    }

    fn finish(self) -> Result<(), Error> {
        if self.pos == self.body.len() {
            Ok(())
        } else {
            Err(Error::BadPayload(self.kind))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use quickcheck::quickcheck;

    const MAX: u32 = max_message_size(DEFAULT_MAX_BLOCK_SIZE);

    fn decoder() -> Decoder {
        Decoder::new(Network::Mainnet.magic(), MAX, 1024)
    }

    fn frame(msg: &RawNetworkMessage) -> Vec<u8> {
        encode(Network::Mainnet.magic(), msg).unwrap()
    }

    #[test]
    fn ping_split_at_every_boundary_decodes_once() {
        let msg = RawNetworkMessage::new(42, NetworkMessage::Ping);
        let bytes = frame(&msg);

        for split in 0..bytes.len() {
            let mut decoder = decoder();

            decoder.input(&bytes[..split]);
            // A prefix never yields a message or an error.
            assert_eq!(decoder.decode_next(), Ok(None), "split at {}", split);

            decoder.input(&bytes[split..]);
            assert_eq!(decoder.decode_next(), Ok(Some(msg.clone())));
            assert_eq!(decoder.decode_next(), Ok(None));
        }
    }

    #[test]
    fn oversize_length_is_rejected_from_the_header_alone() {
        let mut header = Vec::new();
        header.extend_from_slice(&Network::Mainnet.magic());
        header.extend_from_slice(&MessageType::Transaction.code().to_be_bytes());
        header.extend_from_slice(&7i32.to_be_bytes());
        header.extend_from_slice(&(MAX + 1).to_be_bytes());

        let mut decoder = decoder();
        decoder.input(&header);
        assert_eq!(
            decoder.decode_next(),
            Err(Error::Oversize {
                length: MAX + 1,
                max: MAX
            })
        );
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let msg = RawNetworkMessage::unsolicited(NetworkMessage::Ping);
        let bytes = encode(Network::Testnet.magic(), &msg).unwrap();

        let mut decoder = decoder();
        decoder.input(&bytes);
        assert_eq!(
            decoder.decode_next(),
            Err(Error::BadMagic(Network::Testnet.magic()))
        );
    }

    #[test]
    fn corrupted_payload_fails_the_checksum() {
        let msg = RawNetworkMessage::new(1, NetworkMessage::Height(100));
        let mut bytes = frame(&msg);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let mut decoder = decoder();
        decoder.input(&bytes);
        assert_eq!(decoder.decode_next(), Err(Error::BadChecksum));
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&Network::Mainnet.magic());
        bytes.extend_from_slice(&99u32.to_be_bytes());
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());

        let mut decoder = decoder();
        decoder.input(&bytes);
        assert_eq!(decoder.decode_next(), Err(Error::UnknownType(99)));
    }

    #[test]
    fn truncated_payload_inside_a_complete_frame_is_malformed() {
        // A VERSION frame must carry exactly four payload bytes.
        let body = [0u8; 2];
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&Network::Mainnet.magic());
        bytes.extend_from_slice(&MessageType::Version.code().to_be_bytes());
        bytes.extend_from_slice(&3i32.to_be_bytes());
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&checksum(&body));
        bytes.extend_from_slice(&body);

        let mut decoder = decoder();
        decoder.input(&bytes);
        assert_eq!(
            decoder.decode_next(),
            Err(Error::BadPayload(MessageType::Version))
        );
    }

    #[test]
    fn several_frames_in_one_buffer_decode_in_order() {
        let first = RawNetworkMessage::new(1, NetworkMessage::GetPeers);
        let second = RawNetworkMessage::new(2, NetworkMessage::Height(9));
        let third = RawNetworkMessage::unsolicited(NetworkMessage::Transaction(vec![1, 2, 3]));

        let mut decoder = decoder();
        decoder.input(&frame(&first));
        decoder.input(&frame(&second));
        decoder.input(&frame(&third));

        assert_eq!(decoder.decode_next(), Ok(Some(first)));
        assert_eq!(decoder.decode_next(), Ok(Some(second)));
        assert_eq!(decoder.decode_next(), Ok(Some(third)));
        assert_eq!(decoder.decode_next(), Ok(None));
    }

    #[test]
    fn structured_payloads_survive_the_wire() {
        let msgs = vec![
            NetworkMessage::Peers(vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()]),
            NetworkMessage::PeersV2(vec![
                PeerAddress::parse("node.example.com:12392", 12392).unwrap(),
                PeerAddress::parse("[2001:db8::1]:9000", 12392).unwrap(),
            ]),
            NetworkMessage::HeightV2(BlockSummary {
                height: 1_000_000,
                signature: vec![7u8; BLOCK_SIGNATURE_LENGTH],
                timestamp: 1_700_000_000_000,
                minter_public_key: vec![9u8; MINTER_KEY_LENGTH],
            }),
            NetworkMessage::VerificationCodes {
                send: [1u8; CODE_LENGTH],
                expect: [2u8; CODE_LENGTH],
            },
            NetworkMessage::TransactionSignatures(vec![vec![3u8; TRANSACTION_SIGNATURE_LENGTH]]),
            NetworkMessage::Opaque {
                kind: MessageType::BlockSummaries,
                payload: vec![0xAA; 40],
            },
        ];

        for payload in msgs {
            let msg = RawNetworkMessage::new(5, payload);
            let mut decoder = decoder();
            decoder.input(&frame(&msg));
            assert_eq!(decoder.decode_next(), Ok(Some(msg)));
        }
    }

    quickcheck! {
        /// Feeding a frame in arbitrary chunk sizes always yields
        /// exactly the original message.
        fn decodes_across_arbitrary_chunking(chunks: Vec<u8>) -> bool {
            let msg = RawNetworkMessage::new(
                77,
                NetworkMessage::Transaction(vec![0x42; 100]),
            );
            let bytes = frame(&msg);

            let mut decoder = decoder();
            let mut fed = 0;
            let mut decoded = Vec::new();

            for chunk in chunks {
                let n = (chunk as usize).min(bytes.len() - fed);
                decoder.input(&bytes[fed..fed + n]);
                fed += n;
                while let Ok(Some(m)) = decoder.decode_next() {
                    decoded.push(m);
                }
            }
            decoder.input(&bytes[fed..]);
            while let Ok(Some(m)) = decoder.decode_next() {
                decoded.push(m);
            }

            decoded == vec![msg]
        }
    }
}
