/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [`Context`]: a stack of copy-on-write overlays over committed state.
//!
//! ## Layers
//!
//! Reads fall through three kinds of layers, top to bottom:
//! 1. The context's own **snapshot stack**. Snapshot 0 is the base overlay, which collects everything
//!    the block under construction has written. Each [`snapshot`](Context::snapshot) pushes a fresh
//!    overlay on top.
//! 2. A chain of **frozen** overlays, one per executed-but-not-yet-committed ancestor block. Only
//!    generators build these, when they produce several blocks in one turn (see
//!    [`Context::child`]).
//! 3. The committed state in the [chain store](crate::store::chain_store::ChainStore).
//!
//! ## Hash
//!
//! The context hash covers the flattened snapshot stack (sorted by key) and the emitted events. It does
//! not cover frozen ancestors or committed state, which are covered by earlier headers.

use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    store::{
        chain_store::{ChainStore, StateDelta, StateReader},
        pluggables::{KVStore, Key, StoreError},
        variables,
    },
    types::{
        block::{ChainEvent, Header},
        crypto_primitives::keccak256_concat,
        data_types::{Address, Hash256},
    },
};

use super::errors::ChainError;

pub struct Context {
    reader: Arc<dyn StateReader>,
    parent: Option<Arc<FrozenLayer>>,
    stack: Vec<Overlay>,
    prev_header: Header,
    last_hash: Hash256,
    target_height: u32,
    tx_index: u16,
}

#[derive(Clone, Default)]
struct Overlay {
    delta: StateDelta,
    events: Vec<ChainEvent>,
}

struct FrozenLayer {
    delta: StateDelta,
    parent: Option<Arc<FrozenLayer>>,
}

impl Context {
    /// A context for the block after the store's tip.
    pub fn new<K: KVStore>(store: &ChainStore<K>) -> Result<Context, ChainError> {
        if store.is_closed() {
            return Err(ChainError::ChainClosed);
        }
        let tip = store.tip();
        if !tip.initialized {
            return Err(StoreError::NotInitialized.into());
        }
        let prev_header = store
            .header(tip.height)?
            .ok_or(StoreError::ValueExpectedButNotFound {
                key: Key::Header { height: tip.height },
            })?;
        Ok(Context {
            reader: Arc::new(store.clone()),
            parent: None,
            stack: vec![Overlay::default()],
            prev_header,
            last_hash: tip.hash,
            target_height: tip.height + 1,
            tx_index: 0,
        })
    }

    /// A context over the bare `reader`, for writing the genesis state.
    pub(crate) fn genesis(reader: Arc<dyn StateReader>, genesis_header: Header) -> Context {
        Context {
            reader,
            parent: None,
            stack: vec![Overlay::default()],
            prev_header: genesis_header,
            last_hash: Hash256::zero(),
            target_height: 0,
            tx_index: 0,
        }
    }

    /// A context for the block after `header`, which was executed on `self`.
    ///
    /// The writes of `self` become a frozen layer underneath the new context. `self` must not have open
    /// snapshots.
    pub fn child(&self, header: &Header) -> Context {
        let frozen = FrozenLayer {
            delta: self.delta(),
            parent: self.parent.clone(),
        };
        Context {
            reader: self.reader.clone(),
            parent: Some(Arc::new(frozen)),
            stack: vec![Overlay::default()],
            prev_header: header.clone(),
            last_hash: header.hash(),
            target_height: header.height + 1,
            tx_index: 0,
        }
    }

    pub fn target_height(&self) -> u32 {
        self.target_height
    }

    pub fn last_hash(&self) -> Hash256 {
        self.last_hash
    }

    pub fn last_timestamp(&self) -> u64 {
        self.prev_header.timestamp
    }

    pub fn prev_header(&self) -> &Header {
        &self.prev_header
    }

    /* ↓↓↓ Snapshots ↓↓↓ */

    /// Push a fresh overlay and return its id.
    pub fn snapshot(&mut self) -> usize {
        self.stack.push(Overlay::default());
        self.stack.len() - 1
    }

    /// Drop the overlay `id` and every overlay above it. Reverting the base overlay (id 0) clears it.
    pub fn revert(&mut self, id: usize) {
        if id == 0 {
            self.stack.truncate(1);
            self.stack[0] = Overlay::default();
        } else {
            self.stack.truncate(id);
        }
    }

    /// Merge the overlay `id` and every overlay above it into `id`'s parent. Committing the base
    /// overlay is a no-op: it reaches the store through [`ChainStore::append_block`].
    pub fn commit(&mut self, id: usize) {
        if id == 0 || id >= self.stack.len() {
            return;
        }
        let merged: Vec<Overlay> = self.stack.drain(id..).collect();
        let target = &mut self.stack[id - 1];
        for overlay in merged {
            target.delta.extend(overlay.delta);
            target.events.extend(overlay.events);
        }
    }

    /// Number of overlays in the snapshot stack, counting the base overlay.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Every write in the snapshot stack, flattened.
    pub fn delta(&self) -> StateDelta {
        let mut delta = StateDelta::new();
        for overlay in &self.stack {
            delta.extend(overlay.delta.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        delta
    }

    pub fn events(&self) -> Vec<ChainEvent> {
        self.stack
            .iter()
            .flat_map(|overlay| overlay.events.iter().cloned())
            .collect()
    }

    pub fn hash(&self) -> Hash256 {
        let delta = self
            .delta()
            .try_to_vec()
            .expect("Programming error: failed to serialize a context delta");
        let events = self
            .events()
            .try_to_vec()
            .expect("Programming error: failed to serialize context events");
        keccak256_concat(&[&delta, &events])
    }

    /* ↓↓↓ Raw state ↓↓↓ */

    /// Get a state value (key without the store's `STATE` prefix).
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        for overlay in self.stack.iter().rev() {
            if let Some(value) = overlay.delta.get(key) {
                return value.clone();
            }
        }
        let mut layer = self.parent.as_deref();
        while let Some(frozen) = layer {
            if let Some(value) = frozen.delta.get(key) {
                return value.clone();
            }
            layer = frozen.parent.as_deref();
        }
        self.reader.state(key)
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.top().delta.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.top().delta.insert(key, None);
    }

    fn top(&mut self) -> &mut Overlay {
        self.stack
            .last_mut()
            .expect("Programming error: context stack is never empty")
    }

    pub fn get_value<T: BorshDeserialize>(&self, key: &[u8]) -> Result<Option<T>, ChainError> {
        match self.get(key) {
            None => Ok(None),
            Some(bytes) => T::deserialize(&mut bytes.as_slice()).map(Some).map_err(|source| {
                StoreError::DeserializeValueError {
                    key: Key::State { key: key.to_vec() },
                    source,
                }
                .into()
            }),
        }
    }

    pub fn set_value<T: BorshSerialize>(&mut self, key: Vec<u8>, value: &T) {
        let bytes = value
            .try_to_vec()
            .expect("Programming error: failed to serialize a state value");
        self.set(key, bytes);
    }

    /* ↓↓↓ Accounts ↓↓↓ */

    pub fn accounts(&self) -> Result<Vec<Address>, ChainError> {
        Ok(self.get_value(&variables::ACCOUNTS)?.unwrap_or_default())
    }

    /// Register `address` in the sorted account list. Returns whether it was new.
    pub fn create_account(&mut self, address: Address) -> Result<bool, ChainError> {
        let mut accounts = self.accounts()?;
        match accounts.binary_search(&address) {
            Ok(_) => Ok(false),
            Err(position) => {
                accounts.insert(position, address);
                self.set_value(variables::ACCOUNTS.to_vec(), &accounts);
                Ok(true)
            }
        }
    }

    pub fn account_data(&self, address: &Address, key: &[u8]) -> Option<Vec<u8>> {
        self.get(&variables::account_data_key(address, key))
    }

    pub fn set_account_data(&mut self, address: &Address, key: &[u8], value: Vec<u8>) {
        self.set(variables::account_data_key(address, key), value)
    }

    pub fn contract_data(&self, address: &Address, key: &[u8]) -> Option<Vec<u8>> {
        self.get(&variables::contract_data_key(address, key))
    }

    pub fn set_contract_data(&mut self, address: &Address, key: &[u8], value: Vec<u8>) {
        self.set(variables::contract_data_key(address, key), value)
    }

    pub fn seq(&self, address: &Address) -> Result<u64, ChainError> {
        Ok(self.get_value(&variables::seq_key(address))?.unwrap_or(0))
    }

    pub fn set_seq(&mut self, address: &Address, seq: u64) {
        self.set_value(variables::seq_key(address), &seq)
    }

    pub fn add_seq(&mut self, address: &Address) -> Result<u64, ChainError> {
        let next = self.seq(address)? + 1;
        self.set_seq(address, next);
        Ok(next)
    }

    pub fn admins(&self) -> Result<Vec<Address>, ChainError> {
        Ok(self.get_value(&variables::ADMINS)?.unwrap_or_default())
    }

    pub fn set_admins(&mut self, admins: &Vec<Address>) {
        self.set_value(variables::ADMINS.to_vec(), admins)
    }

    /* ↓↓↓ Time-slots ↓↓↓ */

    pub fn is_used_time_slot(&self, slot: u64, tx_hash: &Hash256) -> bool {
        self.get(&variables::time_slot_key(slot, tx_hash)).is_some()
    }

    /// Consume `(slot, tx_hash)`. Fails with [`ChainError::UsedTimeSlot`] if it was consumed before.
    pub fn use_time_slot(&mut self, slot: u64, tx_hash: &Hash256) -> Result<(), ChainError> {
        if self.is_used_time_slot(slot, tx_hash) {
            return Err(ChainError::UsedTimeSlot);
        }
        self.set(variables::time_slot_key(slot, tx_hash), vec![1]);

        let count_key = variables::time_slot_count_key(slot);
        let count: u32 = self.get_value(&count_key)?.unwrap_or(0);
        self.set_value(variables::time_slot_entry_key(slot, count), tx_hash);
        self.set_value(count_key, &(count + 1));
        Ok(())
    }

    /* ↓↓↓ Events ↓↓↓ */

    pub(crate) fn set_tx_index(&mut self, index: u16) {
        self.tx_index = index;
    }

    /// Emit an event attributed to the transaction being executed.
    pub fn emit_event(&mut self, name: impl Into<String>, data: Vec<u8>) {
        let event = ChainEvent {
            index: self.tx_index,
            name: name.into(),
            data,
        };
        self.top().events.push(event);
    }
}
