use std::{thread, time::Duration};

use log::LevelFilter;
use pof_rs::{
    config::ProtocolParams,
    consensus::{
        messages::{BlockGenMessage, BlockReqMessage, BlockRevokeMessage},
        pof::ConsensusData,
    },
    networking::{
        codec::{decode_packet, encode_packet},
        mesh::Mesh,
    },
    types::{block::Block, data_types::Hash256},
};

mod common;

use common::{
    cluster::{wait_until, Cluster, CHAIN_ID, OBSERVER_SIDE},
    logging::{log_step, setup_logger},
    network::MeshStub,
};

/// Tests that a generator produces its whole turn while the observers commit its blocks one by one.
///
/// Runs 3 observers and 2 generators with 3 blocks per turn, and checks that the chain carries blocks
/// past the first of a turn, all produced by the generator that started the turn, without any generator
/// being timed out.
#[test]
fn generator_multi_block_turn_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start the network.
    log_step(1, "Starting 3 observers and 2 generators.");
    let mut cluster = Cluster::new(3, 2, 0);
    cluster.start_all();

    // 2. Two full turns.
    log_step(2, "Waiting for height 6.");
    assert!(wait_until(Duration::from_secs(30), || cluster.observer_height(0) >= 6));

    // 3. Every turn index of a turn was committed, and each block past the first continues its parent's turn.
    log_step(3, "Checking the turn indices.");
    let store = cluster.observer_stores[0].clone();
    let headers: Vec<_> = (1..=6).map(|height| store.header(height).unwrap().unwrap()).collect();
    let turn_indices: Vec<u32> = headers
        .iter()
        .map(|header| ConsensusData::decode(&header.consensus_data).unwrap().turn_index)
        .collect();
    assert!(turn_indices.contains(&1));
    assert!(turn_indices.contains(&2));
    for (pair, indices) in headers.windows(2).zip(turn_indices.windows(2)) {
        if indices[1] > 0 {
            assert_eq!(indices[1], indices[0] + 1);
            assert_eq!(pair[1].generator, pair[0].generator);
            assert_eq!(pair[1].timeout_count, 0);
        }
    }

    // 4. Nobody waited on a generator.
    log_step(4, "Checking that no generator timed out.");
    assert!(cluster.recorder.generator_timeouts().is_empty());
    cluster.assert_same_chain();
    assert!(!cluster.halted());
}

/// Tests that a generator stops its turn when the observer that requested it revokes or re-targets it.
///
/// Plays the part of the nominated observer by hand over the generator link.
#[test]
fn generator_revoke_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start one generator with long turns, and plug a hand-driven observer into its link.
    log_step(1, "Starting a generator with 10 blocks per turn.");
    let params = ProtocolParams::builder()
        .chain_id(CHAIN_ID)
        .block_time(Duration::from_millis(300))
        .max_blocks_per_generator(10)
        .build();
    let mut cluster = Cluster::with_params(1, 1, 0, params);
    cluster.start_generator(0);
    let generator = cluster.generator_keys[0].public();
    let mut link = cluster
        .generator_hub
        .join(cluster.observer_keys[0].public(), OBSERVER_SIDE);
    let request = BlockReqMessage {
        chain_id: CHAIN_ID,
        prev_hash: cluster.generator_stores[0].last_hash(),
        target_height: 1,
        timeout_count: 0,
        generator: cluster.generator_keys[0].address(),
    };

    // 2. Request a turn and receive its first two blocks.
    log_step(2, "Requesting a turn.");
    link.send_to(&generator, &encode_packet(&request));
    let mut blocks = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        blocks.extend(generated(&mut link));
        blocks.len() >= 2
    }));
    assert_eq!(blocks[0].height(), 1);
    assert_eq!(blocks[1].height(), 2);
    assert_eq!(blocks[1].header.prev_hash, blocks[0].hash());

    // 3. Revoke the turn. At most a block already in flight arrives afterwards.
    log_step(3, "Revoking the turn.");
    link.send_to(
        &generator,
        &encode_packet(&BlockRevokeMessage {
            request: request.clone(),
        }),
    );
    thread::sleep(Duration::from_millis(1500));
    assert!(generated(&mut link).len() <= 1);

    // 4. Request the turn again, then re-target it to the next timeout count before it is over.
    log_step(4, "Requesting the turn again and re-targeting it.");
    link.send_to(&generator, &encode_packet(&request));
    let mut first = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        first.extend(generated(&mut link));
        !first.is_empty()
    }));
    assert_eq!(first[0].height(), 1);
    assert_eq!(first[0].header.timeout_count, 0);

    // A single generator is the top of the rank table for every timeout count.
    let retarget = BlockReqMessage {
        timeout_count: 1,
        ..request
    };
    link.send_to(&generator, &encode_packet(&retarget));
    let mut after = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        after.extend(generated(&mut link));
        after
            .iter()
            .any(|block| block.height() == 1 && block.header.timeout_count == 1)
    }));

    // 5. The new turn builds on its own first block. The revoked turn goes no further than a block in flight.
    log_step(5, "Checking that the new turn continues on its own block.");
    thread::sleep(Duration::from_millis(700));
    after.extend(generated(&mut link));
    let new_first = after
        .iter()
        .find(|block| block.height() == 1 && block.header.timeout_count == 1)
        .unwrap()
        .hash();
    assert!(after
        .iter()
        .any(|block| block.height() == 2 && block.header.prev_hash == new_first));
    let revoked_first = first[0].hash();
    let revoked: Vec<Hash256> = after
        .iter()
        .filter(|block| block.header.prev_hash == revoked_first)
        .map(|block| block.hash())
        .collect();
    assert!(revoked.len() <= 1);
    assert!(!after.iter().any(|block| revoked.contains(&block.header.prev_hash)));
    assert!(!cluster.halted());
}

/// Drain the link, keeping the generated blocks.
fn generated(link: &mut MeshStub) -> Vec<Block> {
    let mut blocks = Vec::new();
    while let Some((_, frame)) = link.recv() {
        if let Ok(message) = decode_packet::<BlockGenMessage>(&frame) {
            blocks.push(message.block);
        }
    }
    blocks
}
