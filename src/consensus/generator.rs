/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The generator's turn worker.
//!
//! A generator's turn starts when an observer sends it a [`BlockReqMessage`] naming it as the top of the
//! rank table for the requested timeout count. It then produces up to
//! [`max_blocks_per_generator`](crate::config::ProtocolParams::max_blocks_per_generator) consecutive
//! blocks, each executed on a child of the previous block's context, so the turn never waits for the
//! observers to commit.
//!
//! ## Pacing
//!
//! The first block is produced immediately. Block `i > 0` is due `200ms + (i - 1) * block_time` after the
//! turn started. Its timestamp is `start + i * block_time`, or one past the previous block's if that is
//! later.
//!
//! ## Commit
//!
//! Produced blocks are kept in a [`GenItem`] map, and their contexts in an arena keyed by a monotonically
//! increasing id. Once a produced block is committed its item is pruned, and the next block of the turn is
//! built on the store's tip instead, as long as that tip is the block this turn produced. When observers send the [`BlockObSignMessage`] for a height, the generator commits its
//! own block with the stored context instead of re-executing it. Blocks forwarded from observers (while
//! another generator's turn runs) are committed by re-executing them.
//!
//! ## Revocation
//!
//! The turn ends early when the observer that requested it gives up on it: either with a
//! [`BlockRevokeMessage`] for the turn's request, or with a new request for a height the turn covers.
//! Blocks of the turn that are not committed yet are dropped.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crate::{
    context::{builder::BlockBuilder, committer::Committer, errors::ChainError, Context},
    events::{CommitBlockEvent, DeadLetterEvent, Event, ProduceBlockEvent},
    networking::{
        codec::{encode_packet, Envelope},
        mesh::Mesh,
    },
    store::pluggables::{KVStore, StoreError},
    txpool::pool::TransactionPool,
    types::{
        block::{Block, Receipt},
        crypto_primitives::Keypair,
        data_types::{Address, Hash256, PublicKey},
        transaction::{slot_of, unix_nanos},
    },
};

use super::{
    errors::{ConsensusError, Halt},
    messages::{BlockGenMessage, BlockObSignMessage, BlockReqMessage, BlockRevokeMessage},
    pof::ConsensusData,
    rank_table::RankTable,
};

/// The delay before the second block of a turn.
pub const FIRST_YIELD: Duration = Duration::from_millis(200);
const RECV_TIMEOUT: Duration = Duration::from_millis(10);

/// A block this generator produced and has not seen committed yet.
struct GenItem {
    block: Block,
    context_id: u64,
    receipts: Vec<Receipt>,
}

/// Executed contexts of produced blocks, keyed by id.
#[derive(Default)]
struct ContextArena {
    next_id: u64,
    contexts: HashMap<u64, Context>,
}

impl ContextArena {
    fn insert(&mut self, ctx: Context) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.contexts.insert(id, ctx);
        id
    }

    fn get(&self, id: u64) -> Option<&Context> {
        self.contexts.get(&id)
    }

    fn remove(&mut self, id: u64) {
        self.contexts.remove(&id);
    }
}

struct Turn {
    origin: PublicKey,
    request: BlockReqMessage,
    started: Instant,
    start_timestamp: u64,
    next_index: u32,
    /// Hash of the last block produced in this turn.
    last_block: Option<Hash256>,
    dead_letters: Vec<(Hash256, String)>,
}

pub(crate) struct Generator<K: KVStore, M: Mesh> {
    keypair: Keypair,
    address: Address,
    committer: Committer<K>,
    pool: Arc<TransactionPool>,
    link: M,
    halt: Halt,
    event_publisher: Option<Sender<Event>>,
    turn: Option<Turn>,
    arena: ContextArena,
    gen_items: BTreeMap<u32, GenItem>,
    forwarded: BTreeMap<u32, Block>,
    pending_signs: BTreeMap<u32, BlockObSignMessage>,
}

impl<K: KVStore, M: Mesh> Generator<K, M> {
    pub(crate) fn new(
        keypair: Keypair,
        committer: Committer<K>,
        pool: Arc<TransactionPool>,
        link: M,
        halt: Halt,
        event_publisher: Option<Sender<Event>>,
    ) -> Generator<K, M> {
        Generator {
            address: keypair.address(),
            keypair,
            committer,
            pool,
            link,
            halt,
            event_publisher,
            turn: None,
            arena: ContextArena::default(),
            gen_items: BTreeMap::new(),
            forwarded: BTreeMap::new(),
            pending_signs: BTreeMap::new(),
        }
    }

    pub(crate) fn start(
        mut self,
        messages: Receiver<(PublicKey, Envelope)>,
        shutdown_signal: Receiver<()>,
    ) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Generator thread disconnected from main thread")
                }
            }
            if self.halt.is_halted() {
                thread::sleep(RECV_TIMEOUT);
                continue;
            }

            match messages.recv_timeout(RECV_TIMEOUT) {
                Ok((origin, envelope)) => self.on_envelope(&origin, &envelope),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => thread::sleep(RECV_TIMEOUT),
            }

            self.prune();
            if let Err(err) = self.produce_due_block() {
                self.on_chain_error("ProduceBlock", err);
            }
        })
    }

    pub fn on_envelope(&mut self, origin: &PublicKey, envelope: &Envelope) {
        if envelope.is::<BlockReqMessage>() {
            match envelope.parse::<BlockReqMessage>() {
                Ok(request) => self.on_block_request(origin, request),
                Err(err) => log::debug!("InvalidBlockReq, {}, {}", origin, err),
            }
        } else if envelope.is::<BlockRevokeMessage>() {
            match envelope.parse::<BlockRevokeMessage>() {
                Ok(message) => self.on_block_revoke(origin, message),
                Err(err) => log::debug!("InvalidBlockRevoke, {}, {}", origin, err),
            }
        } else if envelope.is::<BlockObSignMessage>() {
            match envelope.parse::<BlockObSignMessage>() {
                Ok(message) => {
                    self.pending_signs.insert(message.height, message);
                    self.commit_signed();
                }
                Err(err) => log::debug!("InvalidBlockObSign, {}, {}", origin, err),
            }
        } else if envelope.is::<BlockGenMessage>() {
            match envelope.parse::<BlockGenMessage>() {
                Ok(message) => {
                    let height = message.block.height();
                    if height > self.committer.store().height() && !self.gen_items.contains_key(&height) {
                        self.forwarded.insert(height, message.block);
                        self.commit_signed();
                    }
                }
                Err(err) => log::debug!("InvalidBlockGen, {}, {}", origin, err),
            }
        }
    }

    /* ↓↓↓ Turn ↓↓↓ */

    fn on_block_request(&mut self, origin: &PublicKey, request: BlockReqMessage) {
        let tip = self.committer.store().tip();
        let retargeted = self.turn.as_ref().map_or(false, |turn| {
            turn.origin == *origin
                && turn.request != request
                && request.chain_id == turn.request.chain_id
                && request.target_height < turn.request.target_height + turn.next_index.max(1)
        });
        if retargeted {
            self.revoke_turn("re-targeted");
        }

        if request.chain_id != self.committer.params().chain_id || request.generator != self.address {
            log::debug!("RejectBlockReq, {}, not addressed to this generator", origin);
            return;
        }
        if request.target_height <= tip.height {
            return;
        }

        if let Some(turn) = &self.turn {
            if turn.request == request {
                // The observer missed the first block.
                if let Some(item) = self.gen_items.get(&request.target_height) {
                    let packet = encode_packet(&BlockGenMessage {
                        block: item.block.clone(),
                    });
                    self.link.send_to(origin, &packet);
                }
                return;
            }
            if request.target_height < turn.request.target_height {
                return;
            }
        }

        if request.target_height != tip.height + 1 || request.prev_hash != tip.hash {
            log::debug!(
                "RejectBlockReq, {}, {}, local tip {}",
                origin,
                request.target_height,
                tip.height
            );
            return;
        }
        let top = match RankTable::from_store(self.committer.store()) {
            Ok(table) => table.top(request.timeout_count),
            Err(err) => {
                log::warn!("RejectBlockReq, {}", err);
                return;
            }
        };
        if top != Some(self.address) {
            log::debug!("RejectBlockReq, {}, not the top generator", origin);
            return;
        }

        if self.turn.is_some() {
            self.end_turn("superseded");
        }
        log::debug!(
            "StartTurn, {}, {}, {}",
            origin,
            request.target_height,
            request.timeout_count
        );
        let start_timestamp = unix_nanos().max(tip.timestamp + 1);
        self.turn = Some(Turn {
            origin: *origin,
            request,
            started: Instant::now(),
            start_timestamp,
            next_index: 0,
            last_block: None,
            dead_letters: Vec::new(),
        });
    }

    fn produce_due_block(&mut self) -> Result<(), ChainError> {
        let params = self.committer.params().clone();
        let Some(turn) = &self.turn else {
            return Ok(());
        };
        let index = turn.next_index;
        if index >= params.max_blocks_per_generator {
            self.end_turn("complete");
            return Ok(());
        }
        let due = if index == 0 {
            Duration::ZERO
        } else {
            FIRST_YIELD + params.block_time * (index - 1)
        };
        if turn.started.elapsed() < due {
            return Ok(());
        }

        let height = turn.request.target_height + index;
        // A reward block reads the committed state of its parent; wait for it without blocking.
        if params.reward_interval > 0
            && height % params.reward_interval == 0
            && self.committer.store().height() + 1 < height
        {
            return Ok(());
        }

        let ctx = if index == 0 {
            self.committer.new_context()?
        } else if let Some(prev) = self.gen_items.get(&(height - 1)) {
            let Some(prev_ctx) = self.arena.get(prev.context_id) else {
                self.end_turn("parent context missing");
                return Ok(());
            };
            prev_ctx.child(&prev.block.header)
        } else {
            // The parent was committed and pruned. Build on the tip if the tip is that parent.
            let tip = self.committer.store().tip();
            if tip.height != height - 1 || turn.last_block != Some(tip.hash) {
                self.end_turn("parent block committed elsewhere");
                return Ok(());
            }
            self.committer.new_context()?
        };

        let timestamp = (turn.start_timestamp + params.block_time.as_nanos() as u64 * index as u64)
            .max(ctx.last_timestamp() + 1);
        let timeout_count = if index == 0 {
            turn.request.timeout_count
        } else {
            0
        };
        let origin = turn.origin;
        let mut builder = BlockBuilder::new(
            &self.committer,
            ctx,
            timestamp,
            self.address,
            timeout_count,
            ConsensusData::new(index).encode(),
        )?;

        let slot = slot_of(timestamp);
        let mut dead_letters = Vec::new();
        {
            let mut guard = self.pool.lock();
            while builder.len() < params.max_transactions_per_block {
                let Some(tx) = guard.unsafe_pop(builder.context(), slot) else {
                    break;
                };
                if let Err(err) = builder.add_transaction(&tx) {
                    dead_letters.push((tx.hash, err.to_string()));
                }
            }
        }
        let (block, ctx, receipts) = builder.finalize(&self.keypair)?;

        let header_hash = block.hash();
        let transactions = block.body.transactions.len();
        self.link.send_to(
            &origin,
            &encode_packet(&BlockGenMessage {
                block: block.clone(),
            }),
        );
        log::info!("ProduceBlock, {}, {}, {}, {}", height, header_hash, transactions, index);
        Event::publish(
            &self.event_publisher,
            Event::ProduceBlock(ProduceBlockEvent {
                timestamp: SystemTime::now(),
                height,
                block: header_hash,
                transactions,
                turn_index: index,
            }),
        );

        let context_id = self.arena.insert(ctx);
        self.gen_items.insert(
            height,
            GenItem {
                block,
                context_id,
                receipts,
            },
        );
        if let Some(turn) = &mut self.turn {
            turn.next_index += 1;
            turn.last_block = Some(header_hash);
            turn.dead_letters.extend(dead_letters);
        }
        Ok(())
    }

    fn end_turn(&mut self, reason: &str) {
        let Some(turn) = self.turn.take() else {
            return;
        };
        log::debug!(
            "EndTurn, {}, {}, {}",
            turn.request.target_height,
            turn.next_index,
            reason
        );
        if !turn.dead_letters.is_empty() {
            Event::publish(
                &self.event_publisher,
                Event::DeadLetter(DeadLetterEvent {
                    timestamp: SystemTime::now(),
                    height: turn.request.target_height,
                    transactions: turn.dead_letters,
                }),
            );
        }
    }

    fn on_block_revoke(&mut self, origin: &PublicKey, message: BlockRevokeMessage) {
        if self.turn.as_ref().map_or(false, |turn| turn.request == message.request) {
            log::debug!("RevokeTurn, {}, {}", origin, message.request.target_height);
            self.revoke_turn("revoked");
        }
    }

    /// End the turn and drop its blocks that were not committed.
    fn revoke_turn(&mut self, reason: &str) {
        self.end_turn(reason);
        let height = self.committer.store().height() + 1;
        self.drop_gen_items_from(height);
    }

    /* ↓↓↓ Commit ↓↓↓ */

    /// Commit every signed block that links to the store's tip, in height order.
    fn commit_signed(&mut self) {
        loop {
            if self.halt.is_halted() {
                return;
            }
            let height = self.committer.store().height() + 1;
            let Some(message) = self.pending_signs.get(&height) else {
                return;
            };
            let header_hash = message.header_hash;
            let observer_signatures = message.observer_signatures.clone();

            let result = if let Some(item) = self.gen_items.get(&height).filter(|item| item.block.hash() == header_hash) {
                let mut block = item.block.clone();
                block.body.block_signatures.truncate(1);
                block.body.block_signatures.extend(observer_signatures);
                match self.arena.get(item.context_id) {
                    Some(ctx) => self
                        .committer
                        .connect_block_with_context(&block, ctx, &item.receipts)
                        .map(|()| block),
                    None => Err(ChainError::InvalidContextHash),
                }
            } else if let Some(forwarded) = self.forwarded.get(&height).filter(|block| block.hash() == header_hash) {
                let mut block = forwarded.clone();
                block.body.block_signatures.truncate(1);
                block.body.block_signatures.extend(observer_signatures);
                self.committer.connect_block(&block).map(|()| block)
            } else {
                // Neither ours nor forwarded: the sync client fetches it.
                if self.gen_items.contains_key(&height) {
                    self.end_turn("observers committed another block");
                    self.drop_gen_items_from(height);
                }
                return;
            };
            self.pending_signs.remove(&height);

            match result {
                Ok(block) => self.on_committed(&block),
                Err(ChainError::InvalidHeight { .. })
                | Err(ChainError::Store(StoreError::InvalidAppendHeight { .. })) => (),
                Err(err) => {
                    self.on_chain_error("CommitBlock", err);
                    return;
                }
            }
        }
    }

    fn on_committed(&mut self, block: &Block) {
        let height = block.height();
        self.pool.remove_block(block, self.committer.store());
        log::info!(
            "CommitBlock, {}, {}, {}",
            height,
            block.hash(),
            block.body.transactions.len()
        );
        Event::publish(
            &self.event_publisher,
            Event::CommitBlock(CommitBlockEvent {
                timestamp: SystemTime::now(),
                height,
                block: block.hash(),
                transactions: block.body.transactions.len(),
            }),
        );
    }

    fn drop_gen_items_from(&mut self, height: u32) {
        let dropped = self.gen_items.split_off(&height);
        for item in dropped.into_values() {
            self.arena.remove(item.context_id);
        }
    }

    /// Forget everything at or below the store's tip.
    fn prune(&mut self) {
        let height = self.committer.store().height();
        let live = self.gen_items.split_off(&(height + 1));
        let committed = std::mem::replace(&mut self.gen_items, live);
        for item in committed.into_values() {
            self.arena.remove(item.context_id);
        }
        self.forwarded = self.forwarded.split_off(&(height + 1));
        self.pending_signs = self.pending_signs.split_off(&(height + 1));
        if !self.pending_signs.is_empty() {
            self.commit_signed();
        }
        let stale = self
            .turn
            .as_ref()
            .map_or(false, |turn| turn.next_index == 0 && turn.request.target_height <= height);
        if stale {
            self.end_turn("stale");
        }
    }

    fn on_chain_error(&mut self, tag: &str, err: ChainError) {
        if err.is_fatal() {
            self.halt.raise(ConsensusError::Chain(err));
        } else {
            log::warn!("{}, {}", tag, err);
            self.end_turn("error");
            let height = self.committer.store().height() + 1;
            self.drop_gen_items_from(height);
        }
    }
}
