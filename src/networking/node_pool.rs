/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Known node-mesh peers, persisted across restarts, and the choice of which to dial.
//!
//! Peers with a measured ping are grouped into latency bands (under 50 ms, 250 ms, and 500 ms). A
//! selection takes the [`PEERS_PER_BAND`] fastest of each band, then fills up with peers that have not
//! been measured yet, so that every known peer is eventually tried.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
    time::Duration,
};

use borsh::{BorshDeserialize, BorshSerialize};
use rand::seq::SliceRandom;

use crate::{
    store::{
        pluggables::{get_value, KVStore, Key, StoreError, WriteBatch},
        variables::{self, concat},
    },
    types::data_types::PublicKey,
};

pub const PING_BANDS: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(250),
    Duration::from_millis(500),
];
pub const PEERS_PER_BAND: usize = 5;
pub const ROTATION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NodeRecord {
    pub address: String,
    pub public_key: PublicKey,
    /// Round-trip time of the last successful dial, in milliseconds.
    pub ping_ms: Option<u32>,
}

impl NodeRecord {
    fn band(&self) -> Option<usize> {
        let ping = Duration::from_millis(self.ping_ms? as u64);
        PING_BANDS.iter().position(|limit| ping < *limit)
    }
}

pub struct NodePool<K: KVStore> {
    kv: Mutex<K>,
    records: Mutex<BTreeMap<String, NodeRecord>>,
}

impl<K: KVStore> NodePool<K> {
    /// Load the known peers from `kv`.
    pub fn open(kv: K) -> Result<NodePool<K>, StoreError> {
        let index: Vec<String> =
            get_value(&kv, &variables::NODE_POOL_INDEX, Key::NodePoolIndex)?.unwrap_or_default();
        let mut records = BTreeMap::new();
        for address in index {
            let record: Option<NodeRecord> = get_value(
                &kv,
                &record_key(&address),
                Key::NodeRecord {
                    address: address.clone(),
                },
            )?;
            if let Some(record) = record {
                records.insert(address, record);
            }
        }
        Ok(NodePool {
            kv: Mutex::new(kv),
            records: Mutex::new(records),
        })
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, address: &str) -> Option<NodeRecord> {
        self.records.lock().unwrap().get(address).cloned()
    }

    /// Remember a peer. Returns true if the address was new or now maps to a different key.
    pub fn insert(&self, address: &str, public_key: PublicKey) -> bool {
        let mut records = self.records.lock().unwrap();
        if records
            .get(address)
            .map_or(false, |record| record.public_key == public_key)
        {
            return false;
        }
        let record = NodeRecord {
            address: address.to_string(),
            public_key,
            ping_ms: None,
        };
        records.insert(address.to_string(), record.clone());
        self.persist(&records, Some(&record), None);
        true
    }

    pub fn record_ping(&self, address: &str, ping: Duration) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(address) {
            record.ping_ms = Some(ping.as_millis().min(u32::MAX as u128) as u32);
            let record = record.clone();
            self.persist(&records, Some(&record), None);
        }
    }

    pub fn remove(&self, address: &str) {
        let mut records = self.records.lock().unwrap();
        if records.remove(address).is_some() {
            self.persist(&records, None, Some(address));
        }
    }

    /// The peers to keep outbound connections to, skipping any key in `exclude`.
    pub fn select(&self, exclude: &HashSet<PublicKey>) -> Vec<NodeRecord> {
        let records = self.records.lock().unwrap();
        let mut bands: [Vec<&NodeRecord>; 3] = Default::default();
        let mut unmeasured = Vec::new();
        for record in records.values() {
            if exclude.contains(&record.public_key) {
                continue;
            }
            match record.band() {
                Some(band) => bands[band].push(record),
                None => unmeasured.push(record),
            }
        }

        let mut selected = Vec::new();
        for mut band in bands {
            band.sort_by_key(|record| record.ping_ms);
            selected.extend(band.into_iter().take(PEERS_PER_BAND).cloned());
        }
        unmeasured.shuffle(&mut rand::thread_rng());
        let room = (PEERS_PER_BAND * PING_BANDS.len()).saturating_sub(selected.len());
        selected.extend(unmeasured.into_iter().take(room).cloned());
        selected
    }

    fn persist(
        &self,
        records: &BTreeMap<String, NodeRecord>,
        changed: Option<&NodeRecord>,
        removed: Option<&str>,
    ) {
        let mut wb = K::WriteBatch::new();
        let index: Vec<String> = records.keys().cloned().collect();
        wb.set(&variables::NODE_POOL_INDEX, &encode(&index));
        if let Some(record) = changed {
            wb.set(&record_key(&record.address), &encode(record));
        }
        if let Some(address) = removed {
            wb.delete(&record_key(address));
        }
        self.kv.lock().unwrap().write(wb);
    }
}

fn record_key(address: &str) -> Vec<u8> {
    concat(&variables::NODE_POOL, address.as_bytes())
}

fn encode<T: BorshSerialize>(value: &T) -> Vec<u8> {
    value
        .try_to_vec()
        .expect("Programming error: failed to serialize a node pool record")
}
