/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives used throughout pof_rs: keccak hashing and recoverable secp256k1 signatures.

use std::{fmt, sync::OnceLock};

use rand_core::{OsRng, RngCore};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, Secp256k1, SecretKey,
};
use sha3::{Digest, Keccak256};

use super::data_types::{Address, ChainID, Hash256, PublicKey, Signature};

fn secp() -> &'static Secp256k1<All> {
    static CONTEXT: OnceLock<Secp256k1<All>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::new)
}

pub fn keccak256(bytes: &[u8]) -> Hash256 {
    Hash256::new(Keccak256::digest(bytes).into())
}

/// Keccak over the concatenation of `parts`, without allocating the concatenation.
pub fn keccak256_concat(parts: &[&[u8]]) -> Hash256 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash256::new(hasher.finalize().into())
}

pub fn double_keccak256(bytes: &[u8]) -> Hash256 {
    keccak256(keccak256(bytes).bytes())
}

/// A secp256k1 keypair. Every observer, generator, and node holds one: its public key identifies the
/// peer in handshakes, and its [`Address`] identifies the account.
#[derive(Clone)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    /// Build a keypair from a 32-byte secret key. Fails if the bytes are not a valid scalar.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Keypair, SignatureError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| SignatureError::InvalidPublicKey)?;
        let public = secp256k1::PublicKey::from_secret_key(secp(), &secret);
        Ok(Keypair {
            secret,
            public: PublicKey::new(public.serialize()),
        })
    }

    pub fn generate() -> Keypair {
        loop {
            let mut bytes = [0u8; 32];
            OsRng.fill_bytes(&mut bytes);
            if let Ok(keypair) = Keypair::from_secret_bytes(&bytes) {
                return keypair;
            }
        }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public)
            .expect("Programming error: a keypair's own public key must be valid")
    }

    /// Sign a 32-byte digest, producing a recoverable signature.
    pub fn sign(&self, digest: &Hash256) -> Signature {
        let message = Message::from_digest(*digest.bytes());
        let (recovery_id, compact) = secp()
            .sign_ecdsa_recoverable(&message, &self.secret)
            .serialize_compact();
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&compact);
        bytes[64] = recovery_id.to_i32() as u8;
        Signature::new(bytes)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("public", &self.public).finish_non_exhaustive()
    }
}

impl Address {
    /// The rightmost 20 bytes of the keccak of the uncompressed public key (without its 0x04 tag).
    pub fn from_public_key(public_key: &PublicKey) -> Result<Address, SignatureError> {
        let public = secp256k1::PublicKey::from_slice(public_key.bytes())
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        let digest = keccak256(&public.serialize_uncompressed()[1..]);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest.bytes()[12..]);
        Ok(Address::new(bytes))
    }
}

/// Recover the public key that produced `signature` over `digest`.
pub fn recover_public_key(digest: &Hash256, signature: &Signature) -> Result<PublicKey, SignatureError> {
    let recovery_id = RecoveryId::from_i32(signature.recovery_id() as i32)
        .map_err(|_| SignatureError::InvalidSignature)?;
    let recoverable = RecoverableSignature::from_compact(&signature.bytes()[..64], recovery_id)
        .map_err(|_| SignatureError::InvalidSignature)?;
    let public = secp()
        .recover_ecdsa(&Message::from_digest(*digest.bytes()), &recoverable)
        .map_err(|_| SignatureError::InvalidSignature)?;
    Ok(PublicKey::new(public.serialize()))
}

pub fn recover_address(digest: &Hash256, signature: &Signature) -> Result<Address, SignatureError> {
    Address::from_public_key(&recover_public_key(digest, signature)?)
}

/// EIP-155 legacy `v` of a signature on chain `chain_id`: `recid + ChainID·2 + 35`.
pub fn eip155_v(signature: &Signature, chain_id: ChainID) -> u64 {
    signature.recovery_id() as u64 + chain_id.int() * 2 + 35
}

/// Inverse of [`eip155_v`]. Fails if `v` does not belong to `chain_id`.
pub fn recovery_id_from_eip155_v(v: u64, chain_id: ChainID) -> Result<u8, SignatureError> {
    let base = chain_id.int() * 2 + 35;
    match v.checked_sub(base) {
        Some(recid) if recid <= 3 => Ok(recid as u8),
        _ => Err(SignatureError::InvalidSignature),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("duplicated signature")]
    DuplicatedSignature,
    #[error("insufficient signatures")]
    InsufficientSignature,
}
