use std::{collections::BTreeMap, time::Duration};

use log::LevelFilter;
use pof_rs::{
    config::{ConfigError, ProtocolParams},
    types::data_types::ChainID,
};

mod common;

use common::logging::{log_step, setup_logger};

fn table(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Tests reading protocol parameters from a key-value table.
#[test]
fn protocol_params_from_key_values_test() {
    setup_logger(LevelFilter::Info);

    // 1. An empty table gives the defaults.
    log_step(1, "Reading an empty table.");
    let defaults = ProtocolParams::from_key_values(&BTreeMap::new()).unwrap();
    assert_eq!(defaults, ProtocolParams::default());
    assert_eq!(defaults.max_blocks_per_generator, 10);
    assert_eq!(defaults.max_transactions_per_block, 7000);
    assert_eq!(defaults.block_time, Duration::from_millis(500));

    // 2. Recognized keys override their default.
    log_step(2, "Reading a full table.");
    let params = ProtocolParams::from_key_values(&table(&[
        ("ChainID", "7"),
        ("MaxBlocksPerGenerator", "3"),
        ("MaxTransactionsPerBlock", " 100 "),
        ("BlockTime", "250"),
        ("RewardInterval", "0"),
        ("ChunkUnit", "16"),
        ("PoolCapacity", "5"),
        ("Version", "1"),
    ]))
    .unwrap();
    assert_eq!(params.chain_id, ChainID::new(7));
    assert_eq!(params.max_blocks_per_generator, 3);
    assert_eq!(params.max_transactions_per_block, 100);
    assert_eq!(params.block_time, Duration::from_millis(250));
    assert_eq!(params.reward_interval, 0);
    assert_eq!(params.chunk_unit, 16);
    assert_eq!(params.pool_capacity, 5);
    assert_eq!(params.version, 1);

    // 3. Unknown keys, malformed values, and empty turns are refused.
    log_step(3, "Reading invalid tables.");
    assert_eq!(
        ProtocolParams::from_key_values(&table(&[("MaxBlocks", "3")])),
        Err(ConfigError::UnknownKey("MaxBlocks".to_string()))
    );
    assert!(matches!(
        ProtocolParams::from_key_values(&table(&[("BlockTime", "fast")])),
        Err(ConfigError::InvalidValue { .. })
    ));
    assert!(matches!(
        ProtocolParams::from_key_values(&table(&[("MaxBlocksPerGenerator", "0")])),
        Err(ConfigError::InvalidValue { .. })
    ));
}
