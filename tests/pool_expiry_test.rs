use std::time::Duration;

use log::LevelFilter;
use pof_rs::{
    txpool::pool::PoolError,
    types::transaction::{current_slot, NANOS_PER_SLOT},
};

mod common;

use common::{
    cluster::{wait_until, Cluster, CHAIN_ID},
    keys,
    logging::{log_step, setup_logger},
    token_app::mint_at,
};

/// Tests that stale transactions are either refused at admission or dropped from the pool once their
/// time-slot passes, with an expiry notification.
#[test]
fn pool_expiry_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start a lone node.
    log_step(1, "Starting a node.");
    let mut cluster = Cluster::new(1, 1, 1);
    cluster.start_node(0);
    let node = cluster.nodes[0].as_ref().unwrap();

    // 2. A transaction from five slots ago is refused.
    log_step(2, "Submitting a transaction stamped 5 seconds in the past.");
    let now_slot = current_slot();
    let (tx, signature) = mint_at(CHAIN_ID, &keys::admin(), keys::recipient(), 1, (now_slot - 5) * NANOS_PER_SLOT);
    assert!(matches!(
        node.submit_transaction(tx, signature),
        Err(PoolError::InvalidTransactionTimeSlot { .. })
    ));
    assert_eq!(node.pool().len(), 0);

    // 3. A transaction from the previous slot is admitted, then expires.
    log_step(3, "Submitting a transaction from the previous slot.");
    let (tx, signature) = mint_at(
        CHAIN_ID,
        &keys::admin(),
        keys::recipient(),
        2,
        (current_slot() - 1) * NANOS_PER_SLOT,
    );
    let hash = node.submit_transaction(tx, signature).unwrap();
    assert!(node.pool().contains(&hash));

    log_step(4, "Waiting for the cleaner to drop it.");
    assert!(wait_until(Duration::from_secs(10), || !node.pool().contains(&hash)));
    assert!(wait_until(Duration::from_secs(2), || cluster
        .recorder
        .expirations()
        .contains(&hash)));
}
