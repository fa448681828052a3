use log::LevelFilter;
use pof_rs::{
    consensus::{pof::ConsensusData, rank_table::RankTable},
    context::{application::AppError, builder::BlockBuilder, errors::ChainError},
    types::{
        crypto_primitives::{keccak256, SignatureError},
        transaction::{unix_nanos, SignedTransaction},
    },
};

mod common;

use common::{
    blocks::{committer, produce_block, sign_by_observers},
    cluster::{new_store, CHAIN_ID},
    keys::{self, keypair},
    logging::{log_step, setup_logger},
    token_app::{balance, mint, total_supply, transfer},
};

/// Tests that a block assembled by a generator executes to the same result on a validator, and that
/// tampering with any of its commitments is detected.
#[test]
fn produce_and_verify_block_test() {
    setup_logger(LevelFilter::Info);
    let generators = keys::generator_keypairs(1);
    let observers = keys::observer_keypairs(3);
    let sender = keypair(0xE0, 1);
    let receiver = keypair(0xE0, 2).address();

    let producer_store = new_store(&generators);
    let producer = committer(&producer_store, &observers);
    let validator_store = new_store(&generators);
    let validator = committer(&validator_store, &observers);

    // 1. Assemble a block with a mint and a transfer that spends it.
    log_step(1, "Building a block with a mint and a transfer.");
    let (mint_tx, mint_signature) = mint(CHAIN_ID, &keys::admin(), sender.address(), 100);
    let (transfer_tx, transfer_signature) = transfer(CHAIN_ID, &sender, 0, receiver, 30);
    let block = produce_block(
        &producer,
        &generators[0],
        &observers,
        vec![(mint_tx.clone(), mint_signature), (transfer_tx, transfer_signature)],
    );
    assert_eq!(block.body.transactions.len(), 2);
    assert_eq!(block.body.events.len(), 2);
    assert_eq!(block.body.block_signatures.len(), 3);

    // 2. The validator reaches the same context and commits the block.
    log_step(2, "Executing the block on a validator.");
    let ctx = validator.new_context().unwrap();
    let (executed, receipts) = validator.execute_block(ctx, &block).unwrap();
    assert_eq!(executed.hash(), block.header.context_hash);
    assert_eq!(receipts.len(), 2);
    validator.connect_block(&block).unwrap();
    assert_eq!(total_supply(&validator_store), 100);
    assert_eq!(balance(&validator_store, &sender.address()), 70);
    assert_eq!(balance(&validator_store, &receiver), 30);
    assert_eq!(validator_store.seq(&sender.address()).unwrap(), 1);

    // 3. The block advanced its generator in the stored rank table.
    log_step(3, "Checking the rank table.");
    let table = RankTable::from_store(&validator_store).unwrap();
    assert_eq!(table.ranks()[0].phase, 1);

    // 4. Tampered commitments are rejected.
    log_step(4, "Tampering with the level root and the context hash.");
    let mut tampered = block.clone();
    tampered.header.level_root_hash = keccak256(b"tampered");
    let ctx = producer.new_context().unwrap();
    assert!(matches!(
        producer.execute_block(ctx, &tampered),
        Err(ChainError::InvalidLevelRootHash)
    ));
    let mut tampered = block.clone();
    tampered.header.context_hash = keccak256(b"tampered");
    let ctx = producer.new_context().unwrap();
    assert!(matches!(
        producer.execute_block(ctx, &tampered),
        Err(ChainError::InvalidContextHash)
    ));

    // 5. A block without a majority of observer signatures is not connected.
    log_step(5, "Connecting a block signed by too few observers.");
    let mut unsigned = block.clone();
    unsigned.body.block_signatures.truncate(2);
    assert!(matches!(
        producer.connect_block(&unsigned),
        Err(ChainError::Signature(SignatureError::InsufficientSignature))
    ));
    producer.connect_block(&block).unwrap();
    assert_eq!(producer_store.last_hash(), validator_store.last_hash());

    // 6. A transaction that was already executed cannot be replayed in the next block.
    log_step(6, "Replaying the mint in block 2.");
    let ctx = producer.new_context().unwrap();
    let mut builder = BlockBuilder::new(
        &producer,
        ctx,
        producer_store.last_timestamp() + 1,
        generators[0].address(),
        0,
        ConsensusData::new(0).encode(),
    )
    .unwrap();
    let replay = SignedTransaction::recover(mint_tx, mint_signature).unwrap();
    // Same hash as in block 1: only its time-slot stops it.
    assert_eq!(replay.hash, block.body.transactions[0].hash());
    assert!(matches!(
        builder.add_transaction(&replay),
        Err(ChainError::UsedTimeSlot)
    ));
    assert!(builder.is_empty());
}

/// Tests the rules a generator runs into while assembling a block.
#[test]
fn block_builder_rules_test() {
    setup_logger(LevelFilter::Info);
    let generators = keys::generator_keypairs(2);
    let observers = keys::observer_keypairs(3);
    let store = new_store(&generators);
    let committer = committer(&store, &observers);
    let table = RankTable::from_store(&store).unwrap();
    let top = table.top(0).unwrap();
    let (on_turn, off_turn) = if generators[0].address() == top {
        (&generators[0], &generators[1])
    } else {
        (&generators[1], &generators[0])
    };

    // 1. A timestamp that does not move forward is refused up front.
    log_step(1, "Building on the genesis timestamp.");
    let ctx = committer.new_context().unwrap();
    let result = BlockBuilder::new(
        &committer,
        ctx,
        store.last_timestamp(),
        on_turn.address(),
        0,
        ConsensusData::new(0).encode(),
    );
    assert!(matches!(result, Err(ChainError::InvalidTimestamp { .. })));

    // 2. A transaction the application rejects leaves the block and the context untouched.
    log_step(2, "Adding a transfer without funds.");
    let (tx, signature) = transfer(CHAIN_ID, &keypair(0xE0, 3), 0, keys::recipient(), 1);
    let tx = SignedTransaction::recover(tx, signature).unwrap();
    let ctx = committer.new_context().unwrap();
    let mut builder = BlockBuilder::new(
        &committer,
        ctx,
        unix_nanos(),
        off_turn.address(),
        0,
        ConsensusData::new(0).encode(),
    )
    .unwrap();
    assert!(matches!(
        builder.add_transaction(&tx),
        Err(ChainError::App(AppError::Rejected(_)))
    ));
    assert!(builder.is_empty());
    assert_eq!(builder.context().depth(), 1);
    assert!(builder.context().delta().is_empty());

    // 3. Only the top of the rank table may start a turn.
    log_step(3, "Finalizing a block by a generator whose turn it is not.");
    assert!(matches!(
        builder.finalize(off_turn),
        Err(ChainError::InvalidGenerator)
    ));

    // 4. A non-admin cannot mint.
    log_step(4, "Minting as a non-admin.");
    let impostor = keypair(0xE0, 4);
    let (tx, signature) = mint(CHAIN_ID, &impostor, impostor.address(), 1);
    let tx = SignedTransaction::recover(tx, signature).unwrap();
    let ctx = committer.new_context().unwrap();
    let mut builder = BlockBuilder::new(
        &committer,
        ctx,
        unix_nanos(),
        on_turn.address(),
        0,
        ConsensusData::new(0).encode(),
    )
    .unwrap();
    assert!(matches!(
        builder.add_transaction(&tx),
        Err(ChainError::NotAdmin(address)) if address == impostor.address()
    ));

    // 5. The generator on turn produces a block that commits.
    log_step(5, "Finalizing an empty block by the generator on turn.");
    let (mut block, _, _) = builder.finalize(on_turn).unwrap();
    sign_by_observers(&mut block, &observers);
    committer.connect_block(&block).unwrap();
    assert_eq!(store.height(), 1);
}
