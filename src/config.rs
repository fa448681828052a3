/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Protocol parameters shared by every role on a chain.
//!
//! All observers, generators, and nodes of one network must run with identical [`ProtocolParams`]:
//! they decide how blocks are built and validated. Parameters can be built in code with
//! [`ProtocolParams::builder`], or parsed from an operator-supplied key-value table with
//! [`ProtocolParams::from_key_values`].

use std::{collections::BTreeMap, str::FromStr, time::Duration};

use typed_builder::TypedBuilder;

use crate::types::data_types::ChainID;

#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for [ProtocolParams]. Every parameter is optional and falls back to its default:

    - `.chain_id(...)`: `ChainID(0)`
    - `.version(...)`: `2`
    - `.max_transactions_per_block(...)`: `7000`
    - `.max_blocks_per_generator(...)`: `10`
    - `.reward_interval(...)`: `100`
    - `.block_time(...)`: `500ms`
    - `.chunk_unit(...)`: `1024`
    - `.pool_capacity(...)`: `100000`
"))]
pub struct ProtocolParams {
    #[builder(default = ChainID::new(0), setter(doc = "Set the chain ID. Defaults to 0."))]
    pub chain_id: ChainID,
    #[builder(default = 2, setter(doc = "Set the newest header version this software accepts and produces. Receipt hashes are checked from version 2 on."))]
    pub version: u16,
    #[builder(default = 7000, setter(doc = "Set the maximum number of transactions in a produced block."))]
    pub max_transactions_per_block: usize,
    #[builder(default = 10, setter(doc = "Set the number of consecutive blocks a generator produces per turn. Observers preallocate the same number of block rounds."))]
    pub max_blocks_per_generator: u32,
    #[builder(default = 100, setter(doc = "Set the height modulus at which the application processes rewards. Zero disables rewards."))]
    pub reward_interval: u32,
    #[builder(default = Duration::from_millis(500), setter(doc = "Set the target spacing between blocks."))]
    pub block_time: Duration,
    #[builder(default = 1024, setter(doc = "Set the number of blocks per pile chunk file."))]
    pub chunk_unit: u32,
    #[builder(default = 100_000, setter(doc = "Set the maximum number of pending transactions in the pool."))]
    pub pool_capacity: usize,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        ProtocolParams::builder().build()
    }
}

impl ProtocolParams {
    /// Parse parameters from a `key → value` table. Keys that are missing keep their default.
    ///
    /// Recognized keys: `MaxTransactionsPerBlock`, `MaxBlocksPerGenerator`, `RewardInterval`,
    /// `BlockTime` (milliseconds), `ChunkUnit`, `ChainID`, `Version`, `PoolCapacity`.
    pub fn from_key_values(table: &BTreeMap<String, String>) -> Result<ProtocolParams, ConfigError> {
        let mut params = ProtocolParams::default();
        for (key, value) in table {
            match key.as_str() {
                "MaxTransactionsPerBlock" => params.max_transactions_per_block = parse(key, value)?,
                "MaxBlocksPerGenerator" => params.max_blocks_per_generator = parse(key, value)?,
                "RewardInterval" => params.reward_interval = parse(key, value)?,
                "BlockTime" => params.block_time = Duration::from_millis(parse(key, value)?),
                "ChunkUnit" => params.chunk_unit = parse(key, value)?,
                "ChainID" => params.chain_id = ChainID::new(parse(key, value)?),
                "Version" => params.version = parse(key, value)?,
                "PoolCapacity" => params.pool_capacity = parse(key, value)?,
                _ => return Err(ConfigError::UnknownKey(key.clone())),
            }
        }
        if params.max_blocks_per_generator == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MaxBlocksPerGenerator".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(params)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown configuration key {0:?}")]
    UnknownKey(String),
    #[error("invalid value {value:?} for configuration key {key:?}")]
    InvalidValue { key: String, value: String },
}
