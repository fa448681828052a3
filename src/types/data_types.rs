/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number that uniquely identifies a blockchain.
///
/// Every observer, generator, and node of the same network must be configured with the same `ChainID`.
/// It is mixed into transaction hashes, peer handshakes, and the EIP-155 `v` value of ether-type
/// signatures, so that messages and transactions from one chain can never be replayed on another.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct ChainID(u64);

impl ChainID {
    /// Create a new `ChainID` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `ChainID`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the little-endian representation of this `ChainID`.
    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl Display for ChainID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 32-byte keccak digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    /// Create a new `Hash256` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The all-zeroes hash, used as padding in the level root and as the "no block" sentinel.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Get a reference to the inner bytes of this `Hash256`.
    pub const fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Display for Hash256 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", to_hex(&self.0))
    }
}

impl Debug for Hash256 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", to_hex(&self.0))
    }
}

/// 20-byte account identifier.
///
/// An `Address` is the rightmost 20 bytes of the keccak digest of an uncompressed secp256k1 public key
/// (see [`Address::from_public_key`](crate::types::crypto_primitives)). The zero address is a sentinel
/// meaning "no recipient": transactions sent to it are admin transactions.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct Address([u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 20])
    }

    pub const fn bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", to_hex(&self.0))
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{})", to_hex(&self.0))
    }
}

impl FromStr for Address {
    type Err = ParseBytesError;

    /// Parse a 40-hex-digit address, with or without a leading `0x`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = from_hex(s.strip_prefix("0x").unwrap_or(s))?;
        let array: [u8; 20] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| ParseBytesError::InvalidLength(bytes.len()))?;
        Ok(Address(array))
    }
}

/// 33-byte compressed secp256k1 public key.
///
/// Peers in every mesh are identified by their `PublicKey`. Observers are configured with the full list
/// of observer public keys, and generators are identified through the [`Address`] derived from theirs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct PublicKey([u8; 33]);

impl PublicKey {
    pub const fn new(bytes: [u8; 33]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> &[u8; 33] {
        &self.0
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", to_hex(&self.0))
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", to_hex(&self.0))
    }
}

/// 65-byte recoverable signature: the 64-byte compact ECDSA signature followed by the recovery id.
///
/// Ether-type transactions expose the recovery id in EIP-155 legacy form, `v = recid + ChainID·2 + 35`
/// (see [`eip155_v`](crate::types::crypto_primitives::eip155_v)).
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Signature([u8; 65]);

impl Signature {
    pub const fn new(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> &[u8; 65] {
        &self.0
    }

    /// The trailing recovery byte.
    pub const fn recovery_id(&self) -> u8 {
        self.0[64]
    }

    /// Try to build a `Signature` from a slice, which must be exactly 65 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 65] = bytes.try_into().ok()?;
        Some(Signature(array))
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", to_hex(&self.0))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseBytesError {
    #[error("invalid hex digit in {0:?}")]
    InvalidHex(String),
    #[error("expected 20 bytes, found {0}")]
    InvalidLength(usize),
}

/// Lowercase hex encoding, used for `Display` of byte newtypes and for store file names.
pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

pub fn from_hex(s: &str) -> Result<Vec<u8>, ParseBytesError> {
    if s.len() % 2 != 0 {
        return Err(ParseBytesError::InvalidHex(s.to_string()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ParseBytesError::InvalidHex(s.to_string()))
        })
        .collect()
}
