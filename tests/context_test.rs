use log::LevelFilter;
use pof_rs::{
    context::{errors::ChainError, Context},
    store::variables::{time_slot_count_key, time_slot_entry_key},
    types::{
        block::Header,
        crypto_primitives::keccak256,
        data_types::{Address, Hash256},
    },
};

mod common;

use common::{
    cluster::new_store,
    keys,
    logging::{log_step, setup_logger},
};

const KEY: &[u8] = b"key";

/// Tests nested snapshots: reverting drops a snapshot and everything above it, and committing merges
/// them into the parent.
#[test]
fn context_snapshot_test() {
    setup_logger(LevelFilter::Info);
    let store = new_store(&keys::generator_keypairs(1));
    let account = Address::new([0x11; 20]);

    // 1. Write into the base overlay, then into two nested snapshots.
    log_step(1, "Writing through three overlays.");
    let mut ctx = Context::new(&store).unwrap();
    assert_eq!(ctx.target_height(), 1);
    ctx.set_account_data(&account, KEY, vec![1]);
    let outer = ctx.snapshot();
    ctx.set_account_data(&account, KEY, vec![2]);
    let _inner = ctx.snapshot();
    ctx.set_account_data(&account, KEY, vec![3]);
    ctx.emit_event("Inner", vec![]);
    assert_eq!(ctx.depth(), 3);
    assert_eq!(ctx.account_data(&account, KEY), Some(vec![3]));

    // 2. Reverting the outer snapshot drops the inner one as well.
    log_step(2, "Reverting the outer snapshot.");
    ctx.revert(outer);
    assert_eq!(ctx.depth(), 1);
    assert_eq!(ctx.account_data(&account, KEY), Some(vec![1]));
    assert!(ctx.events().is_empty());

    // 3. Committing merges a snapshot into its parent, keeping the newest value and the events.
    log_step(3, "Committing a nested snapshot.");
    let outer = ctx.snapshot();
    ctx.set_account_data(&account, KEY, vec![4]);
    let _inner = ctx.snapshot();
    ctx.emit_event("Committed", vec![9]);
    ctx.commit(outer);
    assert_eq!(ctx.depth(), 1);
    assert_eq!(ctx.account_data(&account, KEY), Some(vec![4]));
    assert_eq!(ctx.events().len(), 1);
    assert_eq!(ctx.events()[0].name, "Committed");

    // 4. Nothing reached the store.
    log_step(4, "Checking the store is untouched.");
    assert_eq!(store.account_data(&account, KEY), None);

    // 5. Reverting the base overlay clears it.
    log_step(5, "Reverting the base overlay.");
    ctx.revert(0);
    assert_eq!(ctx.account_data(&account, KEY), None);
    assert!(ctx.delta().is_empty());
}

/// Tests that the context hash covers the final writes, not the order they were made in.
#[test]
fn context_hash_test() {
    setup_logger(LevelFilter::Info);
    let store = new_store(&keys::generator_keypairs(1));
    let a = Address::new([0x0A; 20]);
    let b = Address::new([0x0B; 20]);

    // 1. The same writes in a different order hash the same.
    log_step(1, "Writing two accounts in both orders.");
    let mut first = Context::new(&store).unwrap();
    first.set_account_data(&a, KEY, vec![1]);
    first.set_account_data(&b, KEY, vec![2]);
    let mut second = Context::new(&store).unwrap();
    second.set_account_data(&b, KEY, vec![2]);
    let snapshot = second.snapshot();
    second.set_account_data(&a, KEY, vec![1]);
    second.commit(snapshot);
    assert_eq!(first.hash(), second.hash());

    // 2. A different value, or an extra event, changes the hash.
    log_step(2, "Changing a value and emitting an event.");
    let mut third = Context::new(&store).unwrap();
    third.set_account_data(&a, KEY, vec![1]);
    third.set_account_data(&b, KEY, vec![3]);
    assert_ne!(first.hash(), third.hash());
    second.emit_event("Extra", vec![]);
    assert_ne!(first.hash(), second.hash());
}

/// Tests that a transaction consumes its time-slot once, and that a child context sees the slots its
/// parent consumed.
#[test]
fn context_time_slot_test() {
    setup_logger(LevelFilter::Info);
    let store = new_store(&keys::generator_keypairs(1));
    let tx_hash = keccak256(b"transaction");

    // 1. Consuming a slot twice fails.
    log_step(1, "Consuming a slot twice.");
    let mut ctx = Context::new(&store).unwrap();
    assert!(!ctx.is_used_time_slot(100, &tx_hash));
    ctx.use_time_slot(100, &tx_hash).unwrap();
    assert!(ctx.is_used_time_slot(100, &tx_hash));
    assert!(matches!(ctx.use_time_slot(100, &tx_hash), Err(ChainError::UsedTimeSlot)));

    // 2. The same transaction hash may be used in another slot.
    log_step(2, "Consuming another slot.");
    ctx.use_time_slot(101, &tx_hash).unwrap();

    // 3. A child context for the next block still rejects the replay.
    log_step(3, "Replaying in a child context.");
    let header = ctx.prev_header().clone();
    let mut child = ctx.child(&Header {
        height: header.height + 1,
        ..header
    });
    assert_eq!(child.target_height(), 2);
    assert!(matches!(child.use_time_slot(100, &tx_hash), Err(ChainError::UsedTimeSlot)));
    assert!(child.delta().is_empty());

    // 4. A reverted snapshot gives the slot back.
    log_step(4, "Reverting a consumed slot.");
    let other = keccak256(b"other transaction");
    let snapshot = child.snapshot();
    child.use_time_slot(100, &other).unwrap();
    child.revert(snapshot);
    assert!(!child.is_used_time_slot(100, &other));
}

/// Tests that every consumed time-slot writes a fixed number of keys, however full its slot is.
#[test]
fn context_time_slot_entries_test() {
    setup_logger(LevelFilter::Info);
    let store = new_store(&keys::generator_keypairs(1));
    let hashes: Vec<Hash256> = (0..500u32).map(|i| keccak256(&i.to_be_bytes())).collect();

    // 1. Fill one slot.
    log_step(1, "Consuming 500 transactions in one slot.");
    let mut ctx = Context::new(&store).unwrap();
    for tx_hash in &hashes {
        ctx.use_time_slot(7, tx_hash).unwrap();
    }

    // 2. Each transaction added its used record and its entry, and the slot has one count.
    log_step(2, "Checking the written keys.");
    assert_eq!(ctx.delta().len(), 2 * hashes.len() + 1);
    assert_eq!(ctx.get_value::<u32>(&time_slot_count_key(7)).unwrap(), Some(500));
    for (n, tx_hash) in hashes.iter().enumerate() {
        assert!(ctx.is_used_time_slot(7, tx_hash));
        assert_eq!(
            ctx.get_value::<Hash256>(&time_slot_entry_key(7, n as u32)).unwrap(),
            Some(*tx_hash)
        );
    }
    assert!(matches!(ctx.use_time_slot(7, &hashes[250]), Err(ChainError::UsedTimeSlot)));
}
