//! Produce committed blocks without running any replica, for tests that drive the committer and the
//! stores directly.

use std::sync::Arc;

use pof_rs::{
    consensus::{
        messages::observer_sign_digest,
        pof::{majority, ConsensusData, PofConsensus},
    },
    context::{builder::BlockBuilder, committer::Committer},
    store::chain_store::ChainStore,
    types::{
        block::Block,
        crypto_primitives::Keypair,
        data_types::Signature,
        transaction::{unix_nanos, SignedTransaction, Transaction},
    },
};

use super::{cluster::params, keys::public_keys, mem_db::MemDB, token_app::TokenApp};

/// A committer over `store` that enforces the rules of a network run by `observers`.
pub(crate) fn committer(store: &ChainStore<MemDB>, observers: &[Keypair]) -> Committer<MemDB> {
    let params = params();
    Committer::new(
        store.clone(),
        Arc::new(TokenApp),
        Arc::new(PofConsensus::new(
            public_keys(observers),
            params.max_blocks_per_generator,
        )),
        params,
    )
}

/// Build the block after the store's tip as the first block of `generator`'s turn, and sign it with
/// `generator` and a majority of `observers`.
pub(crate) fn produce_block(
    committer: &Committer<MemDB>,
    generator: &Keypair,
    observers: &[Keypair],
    transactions: Vec<(Transaction, Signature)>,
) -> Block {
    let last_timestamp = committer.store().last_timestamp();
    produce_block_at(
        committer,
        generator,
        observers,
        transactions,
        unix_nanos().max(last_timestamp + 1),
    )
}

pub(crate) fn produce_block_at(
    committer: &Committer<MemDB>,
    generator: &Keypair,
    observers: &[Keypair],
    transactions: Vec<(Transaction, Signature)>,
    timestamp: u64,
) -> Block {
    let ctx = committer.new_context().unwrap();
    let mut builder = BlockBuilder::new(
        committer,
        ctx,
        timestamp,
        generator.address(),
        0,
        ConsensusData::new(0).encode(),
    )
    .unwrap();
    for (tx, signature) in transactions {
        let signed = SignedTransaction::recover(tx, signature).unwrap();
        builder.add_transaction(&signed).unwrap();
    }
    let (mut block, _, _) = builder.finalize(generator).unwrap();
    sign_by_observers(&mut block, observers);
    block
}

/// Append a majority of observer signatures to a block that carries only its generator signature.
pub(crate) fn sign_by_observers(block: &mut Block, observers: &[Keypair]) {
    let digest = observer_sign_digest(&block.header.hash(), &block.body.block_signatures[0]);
    block.body.block_signatures.extend(
        observers
            .iter()
            .take(majority(observers.len()))
            .map(|observer| observer.sign(&digest)),
    );
}
