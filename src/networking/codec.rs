/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Packet framing shared by every mesh.
//!
//! ## Frame layout
//!
//! ```text
//!  0        4        8                      8+Length
//!  +--------+--------+----------------------+
//!  | TypeID | Length | gzip(borsh(body))    |
//!  +--------+--------+----------------------+
//! ```
//!
//! Both integers are little-endian. A bare 4-byte [`PING_MAGIC`] in place of a type id is a keep-alive
//! frame with no length and no body.
//!
//! ## Type registry
//!
//! A packet's type id is the last four bytes of the keccak of its fully qualified type name, read as a
//! little-endian `u32`. The table of known ids is built once, on first use, from [`PACKET_NAMES`]; a
//! collision between two names (or with the ping magic) panics on that first use.

use std::{
    collections::HashMap,
    io::{Read, Write},
    sync::OnceLock,
};

use borsh::{BorshDeserialize, BorshSerialize};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::{
    consensus::messages::{
        BlockGenMessage, BlockObSignMessage, BlockReqMessage, BlockRevokeMessage, BlockVoteMessage,
        RoundVoteAckMessage, RoundVoteMessage,
    },
    networking::messages::{PeerListMessage, RequestPeerListMessage},
    sync::messages::{BlockMessage, RequestMessage, StatusMessage},
    txpool::messages::TransactionMessage,
    types::crypto_primitives::keccak256,
};

pub const PING_MAGIC: u32 = 0x12345678;
pub const FRAME_HEADER_LEN: usize = 8;
/// The largest compressed body a peer may send.
pub const MAX_BODY_LEN: u32 = 64 * 1024 * 1024;
/// The largest body a compressed body may inflate to.
pub const MAX_INFLATED_LEN: u64 = 256 * 1024 * 1024;

/// A message that travels between peers as one frame.
pub trait Packet: BorshSerialize + BorshDeserialize + Send + 'static {
    const TYPE_NAME: &'static str;

    fn type_id() -> u32 {
        type_id_of(Self::TYPE_NAME)
    }
}

const PACKET_NAMES: &[&str] = &[
    RoundVoteMessage::TYPE_NAME,
    RoundVoteAckMessage::TYPE_NAME,
    BlockReqMessage::TYPE_NAME,
    BlockRevokeMessage::TYPE_NAME,
    BlockGenMessage::TYPE_NAME,
    BlockVoteMessage::TYPE_NAME,
    BlockObSignMessage::TYPE_NAME,
    StatusMessage::TYPE_NAME,
    RequestMessage::TYPE_NAME,
    BlockMessage::TYPE_NAME,
    TransactionMessage::TYPE_NAME,
    RequestPeerListMessage::TYPE_NAME,
    PeerListMessage::TYPE_NAME,
];

static REGISTRY: OnceLock<HashMap<u32, &'static str>> = OnceLock::new();

pub fn type_id_of(name: &str) -> u32 {
    let digest = keccak256(name.as_bytes());
    let bytes = digest.bytes();
    u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]])
}

/// The process-wide table of registered packet types, keyed by type id.
pub fn registry() -> &'static HashMap<u32, &'static str> {
    REGISTRY.get_or_init(|| {
        let mut table = HashMap::with_capacity(PACKET_NAMES.len());
        for name in PACKET_NAMES {
            let id = type_id_of(name);
            if id == PING_MAGIC {
                panic!("Programming error: packet type {} collides with the ping magic", name)
            }
            if let Some(existing) = table.insert(id, *name) {
                panic!(
                    "Programming error: packet types {} and {} share type id {:#010x}",
                    existing, name, id
                )
            }
        }
        table
    })
}

/// Encode `packet` into a complete frame.
pub fn encode_packet<P: Packet>(packet: &P) -> Vec<u8> {
    let type_id = P::type_id();
    if !registry().contains_key(&type_id) {
        panic!("Programming error: packet type {} is not registered", P::TYPE_NAME)
    }
    let body = packet
        .try_to_vec()
        .expect("Programming error: failed to serialize a packet");
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::fast());
    encoder
        .write_all(&body)
        .expect("Programming error: writing into an in-memory gzip stream failed");
    let compressed = encoder
        .finish()
        .expect("Programming error: closing an in-memory gzip stream failed");

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + compressed.len());
    frame.extend_from_slice(&type_id.to_le_bytes());
    frame.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    frame.extend_from_slice(&compressed);
    frame
}

pub fn ping_frame() -> [u8; 4] {
    PING_MAGIC.to_le_bytes()
}

/// A received frame whose type is registered, with its body inflated but not yet deserialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub type_id: u32,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn decode(frame: &[u8]) -> Result<Envelope, CodecError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(CodecError::Truncated);
        }
        let type_id = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if !registry().contains_key(&type_id) {
            return Err(CodecError::UnknownType(type_id));
        }
        let len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if len > MAX_BODY_LEN {
            return Err(CodecError::TooLarge(len));
        }
        let compressed = &frame[FRAME_HEADER_LEN..];
        if compressed.len() != len as usize {
            return Err(CodecError::Truncated);
        }
        let mut body = Vec::new();
        GzDecoder::new(compressed)
            .take(MAX_INFLATED_LEN)
            .read_to_end(&mut body)
            .map_err(CodecError::Gzip)?;
        Ok(Envelope { type_id, body })
    }

    pub fn type_name(&self) -> &'static str {
        registry().get(&self.type_id).copied().unwrap_or("unknown")
    }

    pub fn is<P: Packet>(&self) -> bool {
        self.type_id == P::type_id()
    }

    pub fn parse<P: Packet>(&self) -> Result<P, CodecError> {
        if !self.is::<P>() {
            return Err(CodecError::UnexpectedType {
                expected: P::TYPE_NAME,
                found: self.type_id,
            });
        }
        P::try_from_slice(&self.body).map_err(CodecError::Deserialize)
    }
}

/// Decode a frame straight into `P`.
pub fn decode_packet<P: Packet>(frame: &[u8]) -> Result<P, CodecError> {
    Envelope::decode(frame)?.parse()
}

pub enum Frame {
    Ping,
    /// A complete frame, header included.
    Packet(Vec<u8>),
}

/// Read one frame from a byte stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, CodecError> {
    let mut type_id = [0u8; 4];
    reader.read_exact(&mut type_id).map_err(CodecError::Io)?;
    if u32::from_le_bytes(type_id) == PING_MAGIC {
        return Ok(Frame::Ping);
    }
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).map_err(CodecError::Io)?;
    let body_len = u32::from_le_bytes(len);
    if body_len > MAX_BODY_LEN {
        return Err(CodecError::TooLarge(body_len));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body_len as usize);
    frame.extend_from_slice(&type_id);
    frame.extend_from_slice(&len);
    frame.resize(FRAME_HEADER_LEN + body_len as usize, 0);
    reader
        .read_exact(&mut frame[FRAME_HEADER_LEN..])
        .map_err(CodecError::Io)?;
    Ok(Frame::Packet(frame))
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame is shorter than its header or declared length")]
    Truncated,
    #[error("unknown packet type id {0:#010x}")]
    UnknownType(u32),
    #[error("expected a {expected} packet, found type id {found:#010x}")]
    UnexpectedType { expected: &'static str, found: u32 },
    #[error("packet body of {0} bytes exceeds the frame limit")]
    TooLarge(u32),
    #[error("gzip error: {0}")]
    Gzip(std::io::Error),
    #[error("failed to deserialize packet body: {0}")]
    Deserialize(std::io::Error),
    #[error("i/o error: {0}")]
    Io(std::io::Error),
}
