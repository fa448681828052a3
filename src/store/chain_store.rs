/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The chain store: committed headers and state in a [`KVStore`], block bodies in a [`BlockPile`].
//!
//! [`ChainStore`] is cheap to clone; all clones share the same underlying stores. It has a single
//! writer and many readers. The cached tip (height, hash, timestamp) is only advanced after the key-value
//! batch for a block has been written, so a reader that observes height `h` can always read block `h`.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, TryRecvError},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    block::{Block, Header, Receipt},
    data_types::{Address, Hash256},
    transaction::slot_of,
};

use super::{
    pile::BlockPile,
    pluggables::{get_value, KVGet, KVStore, Key, StoreError, WriteBatch},
    variables::{self, at_height, concat},
};

/// Changes to state keys (without the `STATE` prefix). `None` deletes the key.
pub type StateDelta = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Read access to committed state, used as the bottom layer of every [`Context`](crate::context::Context).
pub trait StateReader: Send + Sync {
    fn state(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// How many time-slots one shrink pass visits at most.
const MAX_SHRINK_SLOTS: u64 = 86_400;

#[derive(Clone)]
pub struct ChainStore<K: KVStore> {
    kv: K,
    pile: Arc<dyn BlockPile>,
    writer: Arc<Mutex<()>>,
    tip: Arc<(Mutex<Tip>, Condvar)>,
    closed: Arc<AtomicBool>,
}

/// The highest committed block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tip {
    pub height: u32,
    pub hash: Hash256,
    pub timestamp: u64,
    pub initialized: bool,
}

impl<K: KVStore> ChainStore<K> {
    pub fn open(kv: K, pile: Arc<dyn BlockPile>) -> Result<ChainStore<K>, StoreError> {
        let tip = match kv.genesis_hash()? {
            None => Tip::default(),
            Some(genesis_hash) => {
                pile.init(&genesis_hash)?;
                let height = kv.height()?.unwrap_or(0);
                let hash = if height == 0 {
                    genesis_hash
                } else {
                    kv.block_hash(height)?
                        .ok_or(StoreError::ValueExpectedButNotFound {
                            key: Key::BlockHash { height },
                        })?
                };
                let header = kv.header(height)?.ok_or(StoreError::ValueExpectedButNotFound {
                    key: Key::Header { height },
                })?;
                Tip {
                    height,
                    hash,
                    timestamp: header.timestamp,
                    initialized: true,
                }
            }
        };

        Ok(ChainStore {
            kv,
            pile,
            writer: Arc::new(Mutex::new(())),
            tip: Arc::new((Mutex::new(tip), Condvar::new())),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /* ↓↓↓ Chain reads ↓↓↓ */

    pub fn tip(&self) -> Tip {
        *self.tip.0.lock().unwrap()
    }

    pub fn is_initialized(&self) -> bool {
        self.tip().initialized
    }

    pub fn height(&self) -> u32 {
        self.tip().height
    }

    pub fn last_hash(&self) -> Hash256 {
        self.tip().hash
    }

    pub fn last_timestamp(&self) -> u64 {
        self.tip().timestamp
    }

    pub fn genesis_hash(&self) -> Result<Hash256, StoreError> {
        self.kv.genesis_hash()?.ok_or(StoreError::NotInitialized)
    }

    /// Hash of the block at `height`. `hash(0)` is the genesis hash.
    pub fn hash(&self, height: u32) -> Result<Option<Hash256>, StoreError> {
        self.check_open()?;
        if height > self.height() {
            return Ok(None);
        }
        self.kv.block_hash(height)
    }

    pub fn header(&self, height: u32) -> Result<Option<Header>, StoreError> {
        self.check_open()?;
        if height > self.height() {
            return Ok(None);
        }
        self.kv.header(height)
    }

    pub fn block(&self, height: u32) -> Result<Option<Block>, StoreError> {
        self.check_open()?;
        if height == 0 || height > self.height() {
            return Ok(None);
        }
        self.pile_block(height)?
            .map(Some)
            .ok_or(StoreError::ValueExpectedButNotFound {
                key: Key::Block { height },
            })
    }

    pub fn receipts(&self, height: u32) -> Result<Option<Vec<Receipt>>, StoreError> {
        self.check_open()?;
        self.kv.receipts(height)
    }

    fn pile_block(&self, height: u32) -> Result<Option<Block>, StoreError> {
        match self.pile.get(height)? {
            None => Ok(None),
            Some(bytes) => Block::try_from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::DeserializeValueError {
                    key: Key::Block { height },
                    source,
                }),
        }
    }

    /* ↓↓↓ State reads ↓↓↓ */

    pub fn accounts(&self) -> Result<Vec<Address>, StoreError> {
        Ok(self.state_value(&variables::ACCOUNTS)?.unwrap_or_default())
    }

    pub fn account_data(&self, address: &Address, key: &[u8]) -> Option<Vec<u8>> {
        self.kv.state(&variables::account_data_key(address, key))
    }

    pub fn contract_data(&self, address: &Address, key: &[u8]) -> Option<Vec<u8>> {
        self.kv.state(&variables::contract_data_key(address, key))
    }

    pub fn seq(&self, address: &Address) -> Result<u64, StoreError> {
        Ok(self.state_value(&variables::seq_key(address))?.unwrap_or(0))
    }

    pub(crate) fn state_value<T: BorshDeserialize>(&self, key: &[u8]) -> Result<Option<T>, StoreError> {
        get_value(
            &self.kv,
            &concat(&variables::STATE, key),
            Key::State { key: key.to_vec() },
        )
    }

    pub(crate) fn kv(&self) -> &K {
        &self.kv
    }

    /* ↓↓↓ Writes ↓↓↓ */

    /// Initialize the store with its genesis. Calling this again with the same genesis hash is a no-op.
    pub fn store_genesis(
        &self,
        genesis_hash: &Hash256,
        header: &Header,
        delta: &StateDelta,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        let _writer = self.writer.lock().unwrap();
        if let Some(existing) = self.kv.genesis_hash()? {
            return if existing == *genesis_hash {
                Ok(())
            } else {
                Err(StoreError::GenesisMismatch)
            };
        }
        self.pile.init(genesis_hash)?;

        let mut wb = K::WriteBatch::new();
        wb.set(&variables::GENESIS_HASH, &encode(genesis_hash));
        wb.set(&variables::HEIGHT, &encode(&0u32));
        wb.set(&at_height(&variables::BLOCK_HASH_AT, 0), &encode(genesis_hash));
        wb.set(&at_height(&variables::HEADER_AT, 0), &encode(header));
        write_delta(&mut wb, delta);
        self.kv.clone().write(wb);

        self.advance_tip(Tip {
            height: 0,
            hash: *genesis_hash,
            timestamp: header.timestamp,
            initialized: true,
        });
        Ok(())
    }

    /// Atomically append `block` with the state changes and receipts produced by executing it.
    ///
    /// The block goes to the pile first. If the pile already holds it (crash replay), it is not
    /// written again.
    pub fn append_block(
        &self,
        block: &Block,
        delta: &StateDelta,
        receipts: &[Receipt],
    ) -> Result<(), StoreError> {
        self.check_open()?;
        let _writer = self.writer.lock().unwrap();
        let tip = self.tip();
        if !tip.initialized {
            return Err(StoreError::NotInitialized);
        }
        let height = block.height();
        if height != tip.height + 1 {
            return Err(StoreError::InvalidAppendHeight {
                expected: tip.height + 1,
                found: height,
            });
        }

        if self.pile.height() < height {
            self.pile.append(height, &encode(block))?;
        }

        let hash = block.hash();
        let mut wb = K::WriteBatch::new();
        wb.set(&variables::HEIGHT, &encode(&height));
        wb.set(&at_height(&variables::BLOCK_HASH_AT, height), &encode(&hash));
        wb.set(&at_height(&variables::HEADER_AT, height), &encode(&block.header));
        wb.set(&at_height(&variables::RECEIPTS_AT, height), &encode(&receipts.to_vec()));
        write_delta(&mut wb, delta);
        self.kv.clone().write(wb);

        self.advance_tip(Tip {
            height,
            hash,
            timestamp: block.header.timestamp,
            initialized: true,
        });
        Ok(())
    }

    fn advance_tip(&self, new_tip: Tip) {
        let (tip, cvar) = &*self.tip;
        *tip.lock().unwrap() = new_tip;
        cvar.notify_all();
    }

    /// Feed every block that is in the pile but not yet reflected in the key-value store to `f`, in
    /// height order. Returns the number of blocks replayed.
    pub fn iter_block_after_context<E, F>(&self, mut f: F) -> Result<u32, E>
    where
        E: From<StoreError>,
        F: FnMut(Block) -> Result<(), E>,
    {
        let mut replayed = 0;
        for height in self.height() + 1..=self.pile.height() {
            let block = self
                .pile_block(height)?
                .ok_or(StoreError::ValueExpectedButNotFound {
                    key: Key::Block { height },
                })?;
            f(block)?;
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Block until the store reaches `height` or `timeout` elapses. Returns whether the height was reached.
    pub fn wait_height(&self, height: u32, timeout: Duration) -> bool {
        let (tip, cvar) = &*self.tip;
        let guard = tip.lock().unwrap();
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |tip| tip.height < height)
            .unwrap();
        guard.height >= height
    }

    /// Delete used time-slot records that can no longer be consumed: every slot older than the last
    /// block's slot minus two. Returns the number of records deleted.
    ///
    /// Does not take the writer lock; it only touches slots that no future block can use.
    pub fn shrink(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        let tip = self.tip();
        if !tip.initialized {
            return Ok(0);
        }
        let cutoff = slot_of(tip.timestamp).saturating_sub(2);
        let from = match self.kv.last_pruned_slot()? {
            Some(last_pruned) => last_pruned + 1,
            None => match self.kv.header(0)? {
                Some(genesis) => slot_of(genesis.timestamp),
                None => return Ok(0),
            },
        }
        .max(cutoff.saturating_sub(MAX_SHRINK_SLOTS));
        if from >= cutoff {
            return Ok(0);
        }

        let mut wb = K::WriteBatch::new();
        let mut removed = 0;
        for slot in from..cutoff {
            let count_key = variables::time_slot_count_key(slot);
            let count: u32 = self.state_value(&count_key)?.unwrap_or(0);
            for n in 0..count {
                let entry_key = variables::time_slot_entry_key(slot, n);
                if let Some(tx_hash) = self.state_value::<Hash256>(&entry_key)? {
                    wb.delete(&concat(&variables::STATE, &variables::time_slot_key(slot, &tx_hash)));
                }
                wb.delete(&concat(&variables::STATE, &entry_key));
            }
            if count > 0 {
                wb.delete(&concat(&variables::STATE, &count_key));
            }
            removed += count as usize;
        }
        wb.set(&variables::LAST_PRUNED_SLOT, &encode(&(cutoff - 1)));
        self.kv.clone().write(wb);
        Ok(removed)
    }

    /// Make every further read or write fail with [`StoreError::StoreClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tip.1.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::StoreClosed)
        } else {
            Ok(())
        }
    }
}

impl<K: KVStore> StateReader for ChainStore<K> {
    fn state(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.kv.state(key)
    }
}

/// Run [`ChainStore::shrink`] every `interval` until shutdown.
pub(crate) fn start_shrinking<K: KVStore>(
    store: ChainStore<K>,
    interval: Duration,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut last_shrink = Instant::now();
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Shrink thread disconnected from main thread")
                }
            }
            if last_shrink.elapsed() >= interval {
                match store.shrink() {
                    Ok(removed) => log::debug!("Shrink, removed {} used time-slots", removed),
                    Err(err) => log::warn!("Shrink failed: {}", err),
                }
                last_shrink = Instant::now();
            }
            thread::sleep(Duration::from_millis(100));
        }
    })
}

fn write_delta<W: WriteBatch>(wb: &mut W, delta: &StateDelta) {
    for (key, value) in delta {
        let key = concat(&variables::STATE, key);
        match value {
            Some(value) => wb.set(&key, value),
            None => wb.delete(&key),
        }
    }
}

fn encode<T: BorshSerialize>(value: &T) -> Vec<u8> {
    value
        .try_to_vec()
        .expect("Programming error: failed to serialize a store value")
}
