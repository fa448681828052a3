use log::LevelFilter;
use pof_rs::{
    networking::codec::decode_packet,
    sync::{
        messages::{BlockMessage, RequestMessage, MAX_BLOCKS_PER_REQUEST},
        server::SyncServer,
    },
};

mod common;

use common::{
    blocks::{committer, produce_block},
    cluster::new_store,
    keys,
    logging::{log_step, setup_logger},
};

/// Tests how the sync server answers requests: aligned batches and single blocks are cached, other
/// ranges are built fresh and cut at the tip.
#[test]
fn sync_server_test() {
    setup_logger(LevelFilter::Info);
    let generators = keys::generator_keypairs(1);
    let observers = keys::observer_keypairs(3);
    let store = new_store(&generators);
    let committer = committer(&store, &observers);

    // 1. Commit 25 blocks.
    log_step(1, "Committing 25 blocks.");
    for _ in 0..25 {
        let block = produce_block(&committer, &generators[0], &observers, Vec::new());
        committer.connect_block(&block).unwrap();
    }
    assert_eq!(store.height(), 25);
    let server = SyncServer::new(store.clone());

    // 2. An aligned batch is built once and then served from the batch cache.
    log_step(2, "Requesting the batch at height 10 twice.");
    let batch = RequestMessage {
        height: 10,
        count: MAX_BLOCKS_PER_REQUEST,
    };
    let first = server.serve(&batch).unwrap().unwrap();
    assert_eq!((first.height, first.count), (10, 10));
    assert!(!first.from_batch_cache);
    let message: BlockMessage = decode_packet(&first.packet).unwrap();
    let heights: Vec<u32> = message.blocks.iter().map(|block| block.height()).collect();
    assert_eq!(heights, (10..20).collect::<Vec<u32>>());
    assert_eq!(message.blocks[0], store.block(10).unwrap().unwrap());

    let second = server.serve(&batch).unwrap().unwrap();
    assert!(second.from_batch_cache);
    assert_eq!(second.packet, first.packet);

    // 3. Single blocks have their own cache.
    log_step(3, "Requesting block 3 twice.");
    let single = RequestMessage { height: 3, count: 1 };
    assert!(!server.serve(&single).unwrap().unwrap().from_single_cache);
    let cached = server.serve(&single).unwrap().unwrap();
    assert!(cached.from_single_cache);
    assert!(!cached.from_batch_cache);
    assert_eq!(cached.count, 1);

    // 4. A batch that runs past the tip is cut short and not cached.
    log_step(4, "Requesting the batch at height 20.");
    let partial = RequestMessage {
        height: 20,
        count: MAX_BLOCKS_PER_REQUEST,
    };
    let served = server.serve(&partial).unwrap().unwrap();
    assert_eq!(served.count, 6);
    assert!(!server.serve(&partial).unwrap().unwrap().from_batch_cache);

    // 5. Oversized and unaligned ranges are capped at the request limit.
    log_step(5, "Requesting 50 blocks from height 2.");
    let served = server
        .serve(&RequestMessage { height: 2, count: 50 })
        .unwrap()
        .unwrap();
    assert_eq!(served.count, MAX_BLOCKS_PER_REQUEST);
    assert!(!served.from_batch_cache && !served.from_single_cache);

    // 6. Nothing is served at or above an unknown height.
    log_step(6, "Requesting heights the store does not have.");
    assert!(server.serve(&RequestMessage { height: 26, count: 1 }).unwrap().is_none());
    assert!(server.serve(&RequestMessage { height: 0, count: 1 }).unwrap().is_none());
    assert!(server.serve(&RequestMessage { height: 5, count: 0 }).unwrap().is_none());
}
