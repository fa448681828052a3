/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Mutual authentication of a freshly opened connection.
//!
//! Both ends run the same four steps, so neither side needs to know whether it dialed or accepted:
//! 1. Send a [`Challenge`] carrying the chain id, a random nonce, the local time, and the bind address
//!    the sender can be dialed on.
//! 2. Read the peer's challenge. Reject it if the chain ids differ or the clocks disagree by more than
//!    [`MAX_TIME_SKEW`].
//! 3. Sign the keccak of the peer's challenge and send the signature back.
//! 4. Read the peer's signature over our own challenge and recover the peer's public key from it.

use std::{
    io::{ErrorKind, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use borsh::{BorshDeserialize, BorshSerialize};
use rand_core::{OsRng, RngCore};
use tungstenite::{Message, WebSocket};

use crate::types::{
    crypto_primitives::{keccak256, recover_public_key, Keypair},
    data_types::{ChainID, Hash256, PublicKey, Signature},
    transaction::unix_nanos,
};

use super::peer::PeerError;

pub const MAX_TIME_SKEW: Duration = Duration::from_secs(30);
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HANDSHAKE_MESSAGE_LEN: u32 = 4096;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Challenge {
    pub chain_id: ChainID,
    pub nonce: [u8; 32],
    /// Nanoseconds since the unix epoch.
    pub timestamp: u64,
    pub bind_address: String,
}

impl Challenge {
    fn new(chain_id: ChainID, bind_address: &str) -> Challenge {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        Challenge {
            chain_id,
            nonce,
            timestamp: unix_nanos(),
            bind_address: bind_address.to_string(),
        }
    }

    fn digest(&self) -> Hash256 {
        keccak256(&encode(self))
    }
}

/// The authenticated identity of the remote end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub public_key: PublicKey,
    pub bind_address: String,
}

/// A connection that can carry whole handshake messages.
pub trait FrameIo {
    fn write_message(&mut self, bytes: &[u8]) -> Result<(), PeerError>;
    fn read_message(&mut self) -> Result<Vec<u8>, PeerError>;
}

impl FrameIo for TcpStream {
    fn write_message(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        self.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.write_all(bytes)?;
        self.flush()?;
        Ok(())
    }

    fn read_message(&mut self) -> Result<Vec<u8>, PeerError> {
        let mut len = [0u8; 4];
        self.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len);
        if len > MAX_HANDSHAKE_MESSAGE_LEN {
            return Err(PeerError::InvalidHandshake("oversized handshake message"));
        }
        let mut bytes = vec![0u8; len as usize];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

impl FrameIo for WebSocket<TcpStream> {
    fn write_message(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        self.send(Message::Binary(bytes.to_vec()))?;
        Ok(())
    }

    fn read_message(&mut self) -> Result<Vec<u8>, PeerError> {
        loop {
            match self.read()? {
                Message::Binary(bytes) => return Ok(bytes),
                Message::Close(_) => return Err(PeerError::PeerClosed),
                _ => continue,
            }
        }
    }
}

pub fn handshake<I: FrameIo>(
    io: &mut I,
    keypair: &Keypair,
    chain_id: ChainID,
    bind_address: &str,
) -> Result<HandshakeOutcome, PeerError> {
    let challenge = Challenge::new(chain_id, bind_address);
    io.write_message(&encode(&challenge))?;

    let theirs = Challenge::try_from_slice(&io.read_message()?)
        .map_err(|_| PeerError::InvalidHandshake("malformed challenge"))?;
    if theirs.chain_id != chain_id {
        return Err(PeerError::InvalidChainID {
            expected: chain_id,
            found: theirs.chain_id,
        });
    }
    let skew = theirs.timestamp.abs_diff(challenge.timestamp);
    if skew > MAX_TIME_SKEW.as_nanos() as u64 {
        return Err(PeerError::InvalidHandshake("clock skew too large"));
    }
    io.write_message(keypair.sign(&theirs.digest()).bytes())?;

    let signature = Signature::from_slice(&io.read_message()?)
        .ok_or(PeerError::InvalidHandshake("malformed signature"))?;
    let public_key = recover_public_key(&challenge.digest(), &signature)?;
    if public_key == keypair.public() {
        return Err(PeerError::SelfConnection);
    }
    Ok(HandshakeOutcome {
        public_key,
        bind_address: theirs.bind_address,
    })
}

/// Open a TCP connection to `address` and authenticate it. The stream is left in blocking mode with no
/// read timeout.
pub fn dial(
    address: &str,
    keypair: &Keypair,
    chain_id: ChainID,
    bind_address: &str,
) -> Result<(TcpStream, HandshakeOutcome), PeerError> {
    let stream = connect(address)?;
    let outcome = accept_stream(&stream, keypair, chain_id, bind_address)?;
    Ok((stream, outcome))
}

/// Authenticate a stream returned by `TcpListener::accept` (or by [`connect`]).
pub fn accept_stream(
    stream: &TcpStream,
    keypair: &Keypair,
    chain_id: ChainID,
    bind_address: &str,
) -> Result<HandshakeOutcome, PeerError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(DIAL_TIMEOUT))?;
    let mut io = stream.try_clone()?;
    let outcome = handshake(&mut io, keypair, chain_id, bind_address)?;
    stream.set_read_timeout(None)?;
    Ok(outcome)
}

pub fn connect(address: &str) -> Result<TcpStream, PeerError> {
    let socket_address = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| PeerError::Io(ErrorKind::AddrNotAvailable.into()))?;
    Ok(TcpStream::connect_timeout(&socket_address, DIAL_TIMEOUT)?)
}

fn encode(challenge: &Challenge) -> Vec<u8> {
    challenge
        .try_to_vec()
        .expect("Programming error: failed to serialize a handshake challenge")
}
