use std::{sync::Arc, thread, time::Duration};

use log::LevelFilter;
use pof_rs::{
    context::errors::ChainError,
    replica::initialize,
    store::{
        chain_store::ChainStore,
        pile::{BlockPile, FilePile, MemPile, PileError},
        pluggables::StoreError,
        variables::{concat, STATE, TIME_SLOT, TIME_SLOT_INDEX},
    },
    types::{crypto_primitives::keccak256, data_types::ChainID, transaction::NANOS_PER_SLOT},
};

mod common;

use common::{
    blocks::{committer, produce_block, produce_block_at},
    cluster::{genesis, new_store, params, CHAIN_ID},
    keys,
    logging::{log_step, setup_logger},
    mem_db::MemDB,
    token_app::{mint, total_supply, TokenApp},
};

/// Tests that initializing a store twice with the same genesis is a no-op, and that a different
/// genesis is refused.
#[test]
fn genesis_test() {
    setup_logger(LevelFilter::Info);
    let generators = keys::generator_keypairs(2);

    // 1. Initialize a fresh store.
    log_step(1, "Initializing a store.");
    let store = ChainStore::open(MemDB::new(), Arc::new(MemPile::new())).unwrap();
    assert!(!store.is_initialized());
    let genesis_hash = initialize(&store, &TokenApp, &params(), &genesis(&generators)).unwrap();
    assert_eq!(store.height(), 0);
    assert_eq!(store.last_hash(), genesis_hash);
    assert_eq!(store.genesis_hash().unwrap(), genesis_hash);

    // 2. The same genesis again changes nothing.
    log_step(2, "Initializing it again with the same genesis.");
    assert_eq!(
        initialize(&store, &TokenApp, &params(), &genesis(&generators)).unwrap(),
        genesis_hash
    );
    assert_eq!(store.height(), 0);

    // 3. Another generator set is another chain.
    log_step(3, "Initializing it with a different genesis.");
    let result = initialize(&store, &TokenApp, &params(), &genesis(&generators[..1]));
    assert!(matches!(result, Err(ChainError::Store(StoreError::GenesisMismatch))));

    // 4. The same genesis on another chain ID hashes differently.
    log_step(4, "Initializing a store on another chain ID.");
    let other = ChainStore::open(MemDB::new(), Arc::new(MemPile::new())).unwrap();
    let mut other_params = params();
    other_params.chain_id = ChainID::new(CHAIN_ID.int() + 1);
    assert_ne!(
        initialize(&other, &TokenApp, &other_params, &genesis(&generators)).unwrap(),
        genesis_hash
    );

    // 5. Reopening the key-value store recovers the tip.
    log_step(5, "Reopening the store.");
    let kv = MemDB::new();
    let first = ChainStore::open(kv.clone(), Arc::new(MemPile::new())).unwrap();
    initialize(&first, &TokenApp, &params(), &genesis(&generators)).unwrap();
    let reopened = ChainStore::open(kv, Arc::new(MemPile::new())).unwrap();
    assert!(reopened.is_initialized());
    assert_eq!(reopened.last_hash(), genesis_hash);
}

/// Tests appending blocks: heights must follow the tip, and waiters are woken when the tip moves.
#[test]
fn append_block_test() {
    setup_logger(LevelFilter::Info);
    let generators = keys::generator_keypairs(1);
    let observers = keys::observer_keypairs(3);
    let store = new_store(&generators);
    let committer = committer(&store, &observers);

    // 1. Connect a block carrying a mint.
    log_step(1, "Connecting block 1.");
    let (tx, signature) = mint(CHAIN_ID, &keys::admin(), keys::recipient(), 50);
    let block = produce_block(&committer, &generators[0], &observers, vec![(tx, signature)]);
    committer.connect_block(&block).unwrap();
    assert_eq!(store.height(), 1);
    assert_eq!(store.last_hash(), block.hash());
    assert_eq!(store.hash(1).unwrap(), Some(block.hash()));
    assert_eq!(store.header(1).unwrap(), Some(block.header.clone()));
    assert_eq!(store.block(1).unwrap(), Some(block.clone()));
    assert_eq!(store.receipts(1).unwrap().unwrap().len(), 1);
    assert_eq!(total_supply(&store), 50);

    // 2. Appending the same height again is refused.
    log_step(2, "Appending block 1 twice.");
    assert!(matches!(
        store.append_block(&block, &Default::default(), &[]),
        Err(StoreError::InvalidAppendHeight { expected: 2, found: 1 })
    ));

    // 3. A waiter on height 2 wakes up once block 2 is connected.
    log_step(3, "Waiting for height 2 while another thread connects it.");
    assert!(!store.wait_height(2, Duration::from_millis(100)));
    let connector = {
        let committer = committer.clone();
        let generator = generators[0].clone();
        let observers = observers.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            let block = produce_block(&committer, &generator, &observers, Vec::new());
            committer.connect_block(&block).unwrap();
        })
    };
    assert!(store.wait_height(2, Duration::from_secs(5)));
    connector.join().unwrap();
    assert!(store.wait_height(1, Duration::ZERO));

    // 4. A closed store refuses further work.
    log_step(4, "Closing the store.");
    store.close();
    assert!(matches!(committer.new_context(), Err(ChainError::ChainClosed)));
}

/// Tests that blocks that reached the pile but not the key-value store are re-executed on startup.
#[test]
fn replay_pile_test() {
    setup_logger(LevelFilter::Info);
    let generators = keys::generator_keypairs(1);
    let observers = keys::observer_keypairs(3);

    // 1. Commit two blocks through a store whose pile is shared.
    log_step(1, "Committing 2 blocks.");
    let pile = Arc::new(MemPile::new());
    let store = ChainStore::open(MemDB::new(), pile.clone()).unwrap();
    initialize(&store, &TokenApp, &params(), &genesis(&generators)).unwrap();
    let first = committer(&store, &observers);
    let (tx, signature) = mint(CHAIN_ID, &keys::admin(), keys::recipient(), 70);
    let block = produce_block(&first, &generators[0], &observers, vec![(tx, signature)]);
    first.connect_block(&block).unwrap();
    let block = produce_block(&first, &generators[0], &observers, Vec::new());
    first.connect_block(&block).unwrap();

    // 2. A key-value store that only holds the genesis sees the pile ahead of it.
    log_step(2, "Opening an empty key-value store over the same pile.");
    let lagging = ChainStore::open(MemDB::new(), pile.clone()).unwrap();
    initialize(&lagging, &TokenApp, &params(), &genesis(&generators)).unwrap();
    assert_eq!(lagging.height(), 0);
    assert_eq!(pile.height(), 2);

    // 3. Replaying brings it to the same tip and state.
    log_step(3, "Replaying the pile.");
    let second = committer(&lagging, &observers);
    assert_eq!(second.replay_pile().unwrap(), 2);
    assert_eq!(lagging.height(), 2);
    assert_eq!(lagging.last_hash(), store.last_hash());
    assert_eq!(total_supply(&lagging), 70);
    assert_eq!(pile.height(), 2);
    assert_eq!(second.replay_pile().unwrap(), 0);
}

/// Tests that shrinking drops the time-slot records no block can consume anymore, once.
#[test]
fn shrink_test() {
    setup_logger(LevelFilter::Info);
    let generators = keys::generator_keypairs(1);
    let observers = keys::observer_keypairs(1);
    let kv = MemDB::new();
    let store = ChainStore::open(kv.clone(), Arc::new(MemPile::new())).unwrap();
    initialize(&store, &TokenApp, &params(), &genesis(&generators)).unwrap();
    let committer = committer(&store, &observers);
    let time_slot_prefix = concat(&STATE, &TIME_SLOT);
    let index_prefix = concat(&STATE, &TIME_SLOT_INDEX);

    // 1. A block with one transaction consumes one time-slot.
    log_step(1, "Connecting a block with a mint.");
    let (tx, signature) = mint(CHAIN_ID, &keys::admin(), keys::recipient(), 1);
    let block = produce_block(&committer, &generators[0], &observers, vec![(tx, signature)]);
    committer.connect_block(&block).unwrap();
    assert_eq!(kv.count_prefix(&time_slot_prefix), 1);
    // The slot's count and its one entry.
    assert_eq!(kv.count_prefix(&index_prefix), 2);

    // 2. While the tip is recent, the record is kept.
    log_step(2, "Shrinking at a recent tip.");
    assert_eq!(store.shrink().unwrap(), 0);
    assert_eq!(kv.count_prefix(&time_slot_prefix), 1);

    // 3. Ten slots later, it is dropped exactly once.
    log_step(3, "Shrinking ten slots later.");
    let later = store.last_timestamp() + 10 * NANOS_PER_SLOT;
    let block = produce_block_at(&committer, &generators[0], &observers, Vec::new(), later);
    committer.connect_block(&block).unwrap();
    assert_eq!(store.shrink().unwrap(), 1);
    assert_eq!(kv.count_prefix(&time_slot_prefix), 0);
    assert_eq!(kv.count_prefix(&index_prefix), 0);
    assert_eq!(store.shrink().unwrap(), 0);
}

/// Tests the chunked file pile: heights span chunk boundaries, and the head survives a reopen.
#[test]
fn file_pile_test() {
    setup_logger(LevelFilter::Info);
    let dir = tempfile::tempdir().unwrap();
    let genesis_hash = keccak256(b"genesis");
    let payload = |height: u32| vec![height as u8; 10 + height as usize];

    // 1. Append five blocks into chunks of two.
    log_step(1, "Appending 5 blocks with a chunk unit of 2.");
    {
        let pile = FilePile::open(dir.path(), 2).unwrap();
        assert_eq!(pile.height(), 0);
        pile.init(&genesis_hash).unwrap();
        for height in 1..=5 {
            pile.append(height, &payload(height)).unwrap();
        }
        assert!(matches!(
            pile.append(7, &payload(7)),
            Err(PileError::HeightOutOfRange { head: 5, found: 7 })
        ));
        for height in 1..=5 {
            assert_eq!(pile.get(height).unwrap(), Some(payload(height)));
        }
    }

    // 2. A reopened pile knows its head and its genesis.
    log_step(2, "Reopening the pile.");
    let pile = FilePile::open(dir.path(), 2).unwrap();
    assert_eq!(pile.height(), 5);
    assert_eq!(pile.get(3).unwrap(), Some(payload(3)));
    assert_eq!(pile.get(0).unwrap(), None);
    assert_eq!(pile.get(6).unwrap(), None);
    assert!(matches!(
        pile.init(&keccak256(b"another genesis")),
        Err(PileError::GenesisMismatch)
    ));
    pile.init(&genesis_hash).unwrap();
    pile.append(6, &payload(6)).unwrap();
    assert_eq!(pile.get(6).unwrap(), Some(payload(6)));

    // 3. The in-memory pile follows the same rules.
    log_step(3, "Checking the in-memory pile.");
    let pile = MemPile::new();
    pile.init(&genesis_hash).unwrap();
    assert!(matches!(
        pile.append(2, &payload(2)),
        Err(PileError::HeightOutOfRange { head: 0, found: 2 })
    ));
    pile.append(1, &payload(1)).unwrap();
    assert_eq!(pile.get(1).unwrap(), Some(payload(1)));
    assert_eq!(pile.height(), 1);
}
