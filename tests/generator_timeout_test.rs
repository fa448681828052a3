use std::time::Duration;

use log::LevelFilter;
use pof_rs::{
    config::ProtocolParams,
    consensus::{pof::ConsensusData, rank_table::RankTable},
};

mod common;

use common::{
    cluster::{wait_until, Cluster, BLOCK_TIME, CHAIN_ID},
    logging::{log_step, setup_logger},
};

/// Tests that observers move on from a generator that stops producing in the middle of its turn.
///
/// Kills the generator whose turn has just started, and checks that the observers time it out, ignore it,
/// and commit the next blocks through the other generator.
#[test]
fn generator_timeout_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start a network whose turns are long enough to kill a generator in the middle of one.
    log_step(1, "Starting 3 observers and 2 generators.");
    let params = ProtocolParams::builder()
        .chain_id(CHAIN_ID)
        .block_time(BLOCK_TIME)
        .max_blocks_per_generator(10)
        .build();
    let mut cluster = Cluster::with_params(3, 2, 0, params);
    cluster.start_generators();
    cluster.start_observers();

    // 2. Wait for the first block of a turn to commit.
    log_step(2, "Waiting for a turn to start.");
    let store = cluster.observer_stores[0].clone();
    let mut turn_start = None;
    assert!(wait_until(Duration::from_secs(30), || {
        let height = store.height();
        let Some(header) = store.header(height).unwrap() else {
            return false;
        };
        let turn_index = ConsensusData::decode(&header.consensus_data).map(|data| data.turn_index);
        if height >= 1 && turn_index == Some(0) {
            turn_start = Some((height, header.generator));
            true
        } else {
            false
        }
    }));
    let (kill_height, killed) = turn_start.unwrap();

    // 3. Kill the generator in its turn.
    log_step(3, "Killing the generator in its turn.");
    let killed_index = cluster
        .generator_keys
        .iter()
        .position(|keypair| keypair.address() == killed)
        .unwrap();
    let survivor = cluster.generator_keys[1 - killed_index].address();
    cluster.stop_generator(killed_index);

    // 4. The observers time the killed generator out.
    log_step(4, "Waiting for the observers to time the generator out.");
    assert!(wait_until(Duration::from_secs(15), || {
        cluster
            .recorder
            .generator_timeouts()
            .iter()
            .any(|(_, generator)| *generator == killed)
    }));

    // 5. The chain moves on through the survivor.
    log_step(5, "Waiting for the survivor to produce.");
    assert!(wait_until(Duration::from_secs(20), || {
        (kill_height + 1..=store.height()).any(|height| {
            store
                .header(height)
                .unwrap()
                .map_or(false, |header| header.generator == survivor)
        })
    }));
    cluster.assert_same_chain();
    assert!(!cluster.halted());
}

/// Tests that the observers move on to the next generator in rank when the top one never delivers.
///
/// Mutes the top generator before the first round, so that the observers see it linked and nominate it,
/// and checks that the first block is produced by the second-ranked generator with a timeout count of 1.
#[test]
fn generator_timeout_count_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start the generators and mute the top of the genesis rank table.
    log_step(1, "Starting 2 generators and muting the top one.");
    let mut cluster = Cluster::new(3, 2, 0);
    let table = RankTable::from_store(&cluster.observer_stores[0]).unwrap();
    let top = table.top(0).unwrap();
    let second = table.top(1).unwrap();
    assert_ne!(top, second);
    let muted_index = cluster
        .generator_keys
        .iter()
        .position(|keypair| keypair.address() == top)
        .unwrap();
    cluster.start_generators();
    cluster
        .generator_hub
        .mute(&cluster.generator_keys[muted_index].public());

    // 2. The observers nominate the muted generator and time it out.
    log_step(2, "Starting 3 observers and waiting for the timeout.");
    cluster.start_observers();
    assert!(wait_until(Duration::from_secs(15), || {
        cluster
            .recorder
            .generator_timeouts()
            .iter()
            .any(|(height, generator)| *height == 1 && *generator == top)
    }));

    // 3. The first block comes from the second-ranked generator, one timeout in.
    log_step(3, "Waiting for the first block.");
    assert!(wait_until(Duration::from_secs(15), || cluster.observer_height(0) >= 1));
    let header = cluster.observer_stores[0].header(1).unwrap().unwrap();
    assert_eq!(header.generator, second);
    assert_eq!(header.timeout_count, 1);
    assert_eq!(
        ConsensusData::decode(&header.consensus_data).map(|data| data.turn_index),
        Some(0)
    );
    cluster.assert_same_chain();
    assert!(!cluster.halted());
}
