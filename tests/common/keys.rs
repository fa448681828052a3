//! Deterministic keys for the scenario tests.

use pof_rs::types::{
    crypto_primitives::Keypair,
    data_types::{Address, PublicKey},
};

/// A keypair whose secret is `prefix` in the first byte and `suffix` in the last two bytes, big-endian.
pub(crate) fn keypair(prefix: u8, suffix: u16) -> Keypair {
    let mut secret = [0u8; 32];
    secret[0] = prefix;
    secret[30..].copy_from_slice(&suffix.to_be_bytes());
    Keypair::from_secret_bytes(&secret).unwrap()
}

/// Observers `0xC0..00..00` through `0xC0..00..0{count - 1}`.
pub(crate) fn observer_keypairs(count: u16) -> Vec<Keypair> {
    (0..count).map(|i| keypair(0xC0, i)).collect()
}

/// Generators `0xB0..00..10` and `0xB0..09..99`, followed by more in the `0xB1` range if asked for.
pub(crate) fn generator_keypairs(count: u16) -> Vec<Keypair> {
    [keypair(0xB0, 0x10), keypair(0xB0, 0x0999)]
        .into_iter()
        .chain((2..count).map(|i| keypair(0xB1, i)))
        .take(count as usize)
        .collect()
}

pub(crate) fn public_keys(keypairs: &[Keypair]) -> Vec<PublicKey> {
    keypairs.iter().map(Keypair::public).collect()
}

pub(crate) fn addresses(keypairs: &[Keypair]) -> Vec<Address> {
    keypairs.iter().map(Keypair::address).collect()
}

/// The admin that mints in the scenarios.
pub(crate) fn admin() -> Keypair {
    keypair(0xA0, 1)
}

/// The recipient of the first mint, `0x477C…616F`.
pub(crate) fn recipient() -> Address {
    "0x477c3c0aae5ef1e0b1e5e8e8a58c8e2f4e07616f".parse().unwrap()
}
