/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The transaction pool.
//!
//! ## Indices
//!
//! Every pending transaction is held in four indices, all behind one mutex:
//! 1. The primary index, by transaction hash.
//! 2. A per-signer index of sequences, for sequenced transactions.
//! 3. A gas queue of the transactions that are ready, ordered by descending gas then arrival, which
//!    [`PoolGuard::unsafe_pop`] scans. Unsequenced transactions are always ready. Of a signer's
//!    sequenced transactions, only the lowest sequence is, and its successor takes its place when it
//!    leaves the pool.
//! 4. An expiry ring of [`EXPIRY_GROUPS`] groups of [`EXPIRY_GROUP_SECONDS`] seconds each, bucketing
//!    transactions by time-slot so [`TransactionPool::clean`] only visits groups that can hold expired
//!    items.
//!
//! ## Time-slot window
//!
//! A transaction is admitted if its slot is in `[current_slot - 1, current_slot + 10]`. Once inside, it
//! expires when its slot falls below `current_slot - 1`.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{
    context::Context,
    store::{
        chain_store::ChainStore,
        pluggables::{KVStore, StoreError},
    },
    types::{
        block::Block,
        data_types::{Address, Hash256},
        transaction::{SignedTransaction, Transaction},
    },
};

pub const EXPIRY_GROUPS: usize = 6;
pub const EXPIRY_GROUP_SECONDS: u64 = 10;
/// How far ahead of the stored sequence a transaction's sequence may be.
pub const MAX_SEQ_DISTANCE: u64 = 100;
/// How many slots ahead of the current slot a transaction may be.
pub const FUTURE_SLOT_WINDOW: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("transaction already exists")]
    ExistTransaction,
    #[error("sequence {seq} is behind the stored sequence {stored}")]
    PastSeq { seq: u64, stored: u64 },
    #[error("sequence {seq} is too far ahead of the stored sequence {stored}")]
    TooFarSeq { seq: u64, stored: u64 },
    #[error("transaction pool is full")]
    TransactionPoolOverflowed,
    #[error("time-slot {slot} is outside the admission window of slot {current_slot}")]
    InvalidTransactionTimeSlot { slot: u64, current_slot: u64 },
    #[error("invalid transaction signature")]
    InvalidSignature,
    #[error("transaction belongs to another chain")]
    InvalidChainID,
    #[error("pre-execution failed: {0}")]
    PreExecution(String),
}

pub struct TransactionPool {
    inner: Mutex<PoolInner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct PoolInner {
    items: HashMap<Hash256, PoolItem>,
    seq_index: HashMap<Address, BTreeMap<u64, Hash256>>,
    gas_queue: BTreeMap<(Reverse<u64>, u64), Hash256>,
    expiry: [HashSet<Hash256>; EXPIRY_GROUPS],
    next_order: u64,
}

struct PoolItem {
    tx: SignedTransaction,
    order: u64,
}

fn expiry_group(slot: u64) -> usize {
    ((slot / EXPIRY_GROUP_SECONDS) % EXPIRY_GROUPS as u64) as usize
}

impl TransactionPool {
    pub fn new(capacity: usize) -> TransactionPool {
        TransactionPool {
            inner: Mutex::new(PoolInner {
                items: HashMap::new(),
                seq_index: HashMap::new(),
                gas_queue: BTreeMap::new(),
                expiry: Default::default(),
                next_order: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Admit `tx`, whose signer has already been recovered. `stored_seq` is the signer's sequence in the
    /// store.
    pub fn push(&self, tx: SignedTransaction, stored_seq: u64, current_slot: u64) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().unwrap();
        self.check(&inner, &tx, stored_seq, current_slot)?;
        if inner.items.len() >= self.capacity {
            return Err(PoolError::TransactionPoolOverflowed);
        }
        inner.insert(tx);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Like [`push`](Self::push), but waits up to `wait` for room if the pool is full.
    pub fn push_waiting(
        &self,
        tx: SignedTransaction,
        stored_seq: u64,
        current_slot: u64,
        wait: Duration,
    ) -> Result<(), PoolError> {
        let deadline = Instant::now() + wait;
        let mut inner = self.inner.lock().unwrap();
        loop {
            self.check(&inner, &tx, stored_seq, current_slot)?;
            if inner.items.len() < self.capacity {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::TransactionPoolOverflowed);
            }
            inner = self.not_full.wait_timeout(inner, deadline - now).unwrap().0;
        }
        inner.insert(tx);
        self.not_empty.notify_all();
        Ok(())
    }

    fn check(
        &self,
        inner: &PoolInner,
        tx: &SignedTransaction,
        stored_seq: u64,
        current_slot: u64,
    ) -> Result<(), PoolError> {
        if inner.items.contains_key(&tx.hash) {
            return Err(PoolError::ExistTransaction);
        }
        check_slot(tx.time_slot(), current_slot)?;
        let transaction = &tx.transaction;
        if transaction.is_sequenced() {
            check_seq(transaction.seq, stored_seq)?;
            let taken = inner
                .seq_index
                .get(&tx.signer())
                .map_or(false, |seqs| seqs.contains_key(&transaction.seq));
            if taken {
                return Err(PoolError::ExistTransaction);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.inner.lock().unwrap().items.contains_key(hash)
    }

    /// Wait until the pool holds at least one transaction, or `timeout` elapses.
    pub fn wait_not_empty(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        let (inner, _) = self
            .not_empty
            .wait_timeout_while(inner, timeout, |inner| inner.items.is_empty())
            .unwrap();
        !inner.items.is_empty()
    }

    /// Take the pool's lock for block construction.
    pub fn lock(&self) -> PoolGuard<'_> {
        PoolGuard {
            pool: self,
            inner: self.inner.lock().unwrap(),
        }
    }

    /// Remove transactions that were included in a committed block, and every sequenced transaction
    /// whose sequence was overtaken. `stored_seq` gives the signer's sequence after the commit. A signer
    /// whose sequence cannot be read keeps its other transactions.
    pub fn remove_committed(
        &self,
        hashes: &[Hash256],
        stored_seq: impl Fn(&Address) -> Result<u64, StoreError>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let mut signers = HashSet::new();
        for hash in hashes {
            if let Some(tx) = inner.remove(hash) {
                if tx.transaction.is_sequenced() {
                    signers.insert(tx.signer());
                }
            }
        }
        for signer in signers {
            let stored = match stored_seq(&signer) {
                Ok(stored) => stored,
                Err(err) => {
                    log::warn!("RemoveCommitted, {}, {}", signer, err);
                    continue;
                }
            };
            let overtaken: Vec<Hash256> = inner
                .seq_index
                .get(&signer)
                .map(|seqs| seqs.range(..stored).map(|(_, hash)| *hash).collect())
                .unwrap_or_default();
            for hash in overtaken {
                inner.remove(&hash);
            }
        }
        self.not_full.notify_all();
    }

    /// [`remove_committed`](Self::remove_committed) for the transactions of `block`, which `store` has
    /// just committed.
    pub fn remove_block<K: KVStore>(&self, block: &Block, store: &ChainStore<K>) {
        let hashes: Vec<Hash256> = block.body.transactions.iter().map(Transaction::hash).collect();
        self.remove_committed(&hashes, |signer| store.seq(signer));
    }

    /// Drop every transaction whose slot is below `current_slot - 1` and return them.
    ///
    /// Calling `clean` twice with the same slot drops nothing the second time.
    pub fn clean(&self, current_slot: u64) -> Vec<Transaction> {
        let mut inner = self.inner.lock().unwrap();
        let min_slot = current_slot.saturating_sub(1);
        let mut expired = Vec::new();
        for group in 0..EXPIRY_GROUPS {
            let stale: Vec<Hash256> = inner.expiry[group]
                .iter()
                .filter(|hash| {
                    inner
                        .items
                        .get(*hash)
                        .map_or(true, |item| item.tx.time_slot() < min_slot)
                })
                .copied()
                .collect();
            for hash in stale {
                if let Some(tx) = inner.remove(&hash) {
                    expired.push(tx.transaction);
                }
                inner.expiry[group].remove(&hash);
            }
        }
        if !expired.is_empty() {
            self.not_full.notify_all();
        }
        expired
    }
}

impl PoolInner {
    fn insert(&mut self, tx: SignedTransaction) {
        let order = self.next_order;
        self.next_order += 1;
        let hash = tx.hash;
        let mut ready = true;
        if tx.transaction.is_sequenced() {
            let seqs = self.seq_index.entry(tx.signer()).or_default();
            let head = seqs.iter().next().map(|(seq, hash)| (*seq, *hash));
            seqs.insert(tx.transaction.seq, hash);
            match head {
                Some((seq, _)) if seq < tx.transaction.seq => ready = false,
                Some((_, head)) => self.unqueue(&head),
                None => (),
            }
        }
        self.expiry[expiry_group(tx.time_slot())].insert(hash);
        let key = (Reverse(tx.transaction.gas), order);
        self.items.insert(hash, PoolItem { tx, order });
        if ready {
            self.gas_queue.insert(key, hash);
        }
    }

    fn remove(&mut self, hash: &Hash256) -> Option<SignedTransaction> {
        let item = self.items.remove(hash)?;
        let tx = item.tx;
        let was_ready = self
            .gas_queue
            .remove(&(Reverse(tx.transaction.gas), item.order))
            .is_some();
        self.expiry[expiry_group(tx.time_slot())].remove(hash);
        if tx.transaction.is_sequenced() {
            let signer = tx.signer();
            let (drained, next) = match self.seq_index.get_mut(&signer) {
                Some(seqs) => {
                    seqs.remove(&tx.transaction.seq);
                    (seqs.is_empty(), seqs.values().next().copied())
                }
                None => (false, None),
            };
            if drained {
                self.seq_index.remove(&signer);
            }
            if let Some(next) = next.filter(|_| was_ready) {
                self.queue(&next);
            }
        }
        Some(tx)
    }

    fn queue(&mut self, hash: &Hash256) {
        if let Some(item) = self.items.get(hash) {
            self.gas_queue
                .insert((Reverse(item.tx.transaction.gas), item.order), *hash);
        }
    }

    fn unqueue(&mut self, hash: &Hash256) {
        if let Some(item) = self.items.get(hash) {
            self.gas_queue
                .remove(&(Reverse(item.tx.transaction.gas), item.order));
        }
    }
}

/// Exclusive access to the pool while a generator drains it into a block.
pub struct PoolGuard<'p> {
    pool: &'p TransactionPool,
    inner: MutexGuard<'p, PoolInner>,
}

impl PoolGuard<'_> {
    pub fn len(&self) -> usize {
        self.inner.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.is_empty()
    }

    /// Remove and return the best candidate for the block under construction in `ctx`: the highest-gas
    /// transaction whose slot is `current_slot` or the one before, and whose sequence (if it has one)
    /// is the one `ctx` expects next. Only ready transactions are visited, so a signer's queued
    /// sequences cost nothing until their predecessor leaves.
    pub fn unsafe_pop(&mut self, ctx: &Context, current_slot: u64) -> Option<SignedTransaction> {
        let min_slot = current_slot.saturating_sub(1);
        let candidate = self.inner.gas_queue.values().copied().find(|hash| {
            let Some(item) = self.inner.items.get(hash) else {
                return false;
            };
            let slot = item.tx.time_slot();
            if slot < min_slot || slot > current_slot {
                return false;
            }
            let transaction = &item.tx.transaction;
            !transaction.is_sequenced()
                || ctx
                    .seq(&item.tx.signer())
                    .map_or(false, |expected| expected == transaction.seq)
        })?;
        let tx = self.inner.remove(&candidate);
        self.pool.not_full.notify_all();
        tx
    }
}

pub fn check_slot(slot: u64, current_slot: u64) -> Result<(), PoolError> {
    if slot + 1 < current_slot || slot > current_slot + FUTURE_SLOT_WINDOW {
        return Err(PoolError::InvalidTransactionTimeSlot { slot, current_slot });
    }
    Ok(())
}

pub fn check_seq(seq: u64, stored: u64) -> Result<(), PoolError> {
    if seq < stored {
        Err(PoolError::PastSeq { seq, stored })
    } else if seq > stored + MAX_SEQ_DISTANCE {
        Err(PoolError::TooFarSeq { seq, stored })
    } else {
        Ok(())
    }
}
