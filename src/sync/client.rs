/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The requesting side of catch-up.
//!
//! The sync client tracks the tip every peer announces through [`StatusMessage`]s, and when a peer is
//! ahead, requests the missing blocks from it:
//! - a height that is a multiple of ten, with ten blocks available above it, is requested as one batch
//!   of ten;
//! - any other height is requested on its own.
//!
//! A request that has not been answered within [`REQUEST_TIMEOUT`] is sent again, to the highest peer.
//! Received blocks are buffered and connected in height order through the
//! [`Committer`](crate::context::committer::Committer).
//!
//! ## Fork detection
//!
//! A peer whose announced hash at a height the local chain has disagrees with the local hash, or whose
//! block at `tip + 1` does not link to the local tip, is on a fork. The peer is removed, a
//! [`ForkDetectedEvent`] is published, and the role [halts](crate::consensus::errors::Halt).
//!
//! The client also announces the local tip: on start, whenever the tip moves, every status interval,
//! and in reply to a peer that announced a lower tip.

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
    consensus::errors::{ConsensusError, Halt},
    context::{committer::Committer, errors::ChainError},
    events::{CommitBlockEvent, Event, ForkDetectedEvent, RequestBlocksEvent},
    networking::{
        codec::{encode_packet, Envelope},
        mesh::{penalize, remove_peer, Mesh},
    },
    store::pluggables::{KVStore, StoreError},
    txpool::pool::TransactionPool,
    types::{
        block::Block,
        data_types::{Hash256, PublicKey},
    },
};

use super::messages::{BlockMessage, RequestMessage, StatusMessage, MAX_BLOCKS_PER_REQUEST};

/// How long a block request may stay unanswered before it is sent again.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// The most heights above the local tip that may be requested or buffered at once.
pub const SYNC_WINDOW: u32 = 100;
const REQUEST_TICK: Duration = Duration::from_millis(200);
const INVALID_BLOCK_POINTS: u32 = 10;

struct PendingRequest {
    peer: PublicKey,
    count: u32,
    sent: Instant,
}

pub struct SyncClient<K: KVStore, M: Mesh> {
    committer: Committer<K>,
    mesh: M,
    pool: Option<Arc<TransactionPool>>,
    status_interval: Duration,
    halt: Halt,
    event_publisher: Option<Sender<Event>>,
    statuses: HashMap<PublicKey, u32>,
    requests: BTreeMap<u32, PendingRequest>,
    blocks: BTreeMap<u32, (PublicKey, Block)>,
    announced: Option<(u32, Instant)>,
}

impl<K: KVStore, M: Mesh> SyncClient<K, M> {
    pub(crate) fn new(
        committer: Committer<K>,
        mesh: M,
        pool: Option<Arc<TransactionPool>>,
        status_interval: Duration,
        halt: Halt,
        event_publisher: Option<Sender<Event>>,
    ) -> SyncClient<K, M> {
        SyncClient {
            committer,
            mesh,
            pool,
            status_interval,
            halt,
            event_publisher,
            statuses: HashMap::new(),
            requests: BTreeMap::new(),
            blocks: BTreeMap::new(),
            announced: None,
        }
    }

    /// Run the client on its own thread, handling the [`StatusMessage`]s and [`BlockMessage`]s routed
    /// to `messages`.
    pub(crate) fn start(
        mut self,
        messages: Receiver<(PublicKey, Envelope)>,
        shutdown_signal: Receiver<()>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut last_tick = Instant::now();
            loop {
                match shutdown_signal.try_recv() {
                    Ok(()) => return,
                    Err(TryRecvError::Empty) => (),
                    Err(TryRecvError::Disconnected) => {
                        panic!("Sync client thread disconnected from main thread")
                    }
                }

                match messages.recv_timeout(REQUEST_TICK) {
                    Ok((origin, envelope)) => self.on_envelope(&origin, &envelope),
                    Err(RecvTimeoutError::Timeout) => (),
                    Err(RecvTimeoutError::Disconnected) => thread::sleep(REQUEST_TICK),
                }

                if last_tick.elapsed() >= REQUEST_TICK {
                    self.tick();
                    last_tick = Instant::now();
                }
            }
        })
    }

    pub fn on_envelope(&mut self, origin: &PublicKey, envelope: &Envelope) {
        if envelope.is::<StatusMessage>() {
            match envelope.parse::<StatusMessage>() {
                Ok(status) => self.on_status(origin, &status),
                Err(err) => log::debug!("InvalidStatus, {}, {}", origin, err),
            }
        } else if envelope.is::<BlockMessage>() {
            match envelope.parse::<BlockMessage>() {
                Ok(message) => self.on_blocks(origin, message),
                Err(err) => log::debug!("InvalidBlockMessage, {}, {}", origin, err),
            }
        }
    }

    pub fn on_status(&mut self, origin: &PublicKey, status: &StatusMessage) {
        let tip = self.committer.store().tip();
        if status.height <= tip.height {
            match self.committer.store().hash(status.height) {
                Ok(Some(local)) if local != status.last_hash => {
                    self.fork(origin, status.height, local, status.last_hash);
                    return;
                }
                Ok(_) => (),
                Err(err) => log::warn!("Status, {}, {}", origin, err),
            }
        }
        if status.height < tip.height {
            self.mesh.send_to(
                origin,
                &encode_packet(&StatusMessage {
                    height: tip.height,
                    last_hash: tip.hash,
                }),
            );
        }
        self.statuses.insert(*origin, status.height);
        if status.height > tip.height {
            self.request_missing();
        }
    }

    pub fn on_blocks(&mut self, origin: &PublicKey, message: BlockMessage) {
        let tip = self.committer.store().tip();
        for block in message.blocks {
            let height = block.height();
            if height <= tip.height {
                if let Ok(Some(local)) = self.committer.store().hash(height) {
                    if local != block.hash() {
                        self.fork(origin, height, local, block.hash());
                        return;
                    }
                }
                continue;
            }
            if height > tip.height + SYNC_WINDOW {
                continue;
            }
            self.requests.remove(&height);
            self.blocks.insert(height, (*origin, block));
        }
        self.connect_buffered();
    }

    /// Send heartbeats and retry expired requests.
    pub fn tick(&mut self) {
        let tip = self.committer.store().tip();
        let announce = match self.announced {
            None => true,
            Some((height, at)) => height != tip.height || at.elapsed() >= self.status_interval,
        };
        if announce {
            self.mesh.broadcast(&encode_packet(&StatusMessage {
                height: tip.height,
                last_hash: tip.hash,
            }));
            self.announced = Some((tip.height, Instant::now()));
        }

        self.requests.retain(|height, _| *height > tip.height);
        self.blocks.retain(|height, _| *height > tip.height);
        let expired: Vec<u32> = self
            .requests
            .iter()
            .filter(|(_, request)| request.sent.elapsed() >= REQUEST_TIMEOUT)
            .map(|(height, _)| *height)
            .collect();
        for height in expired {
            self.requests.remove(&height);
        }
        self.request_missing();
    }

    /// Request every height up to the highest announced tip that is neither buffered nor in flight.
    fn request_missing(&mut self) {
        if self.halt.is_halted() {
            return;
        }
        let Some((peer, best)) = self
            .statuses
            .iter()
            .max_by_key(|(_, height)| **height)
            .map(|(peer, height)| (*peer, *height))
        else {
            return;
        };
        let local = self.committer.store().height();
        let end = best.min(local + SYNC_WINDOW);

        let mut height = local + 1;
        while height <= end {
            let count = if height % MAX_BLOCKS_PER_REQUEST == 0 && height + MAX_BLOCKS_PER_REQUEST - 1 <= best {
                MAX_BLOCKS_PER_REQUEST
            } else {
                1
            };
            let covered = self.blocks.contains_key(&height) || self.in_flight(height);
            if !covered {
                self.mesh.send_to(&peer, &encode_packet(&RequestMessage { height, count }));
                self.requests.insert(
                    height,
                    PendingRequest {
                        peer,
                        count,
                        sent: Instant::now(),
                    },
                );
                Event::publish(
                    &self.event_publisher,
                    Event::RequestBlocks(RequestBlocksEvent {
                        timestamp: SystemTime::now(),
                        peer,
                        height,
                        count,
                    }),
                );
            }
            height += count;
        }
    }

    fn in_flight(&self, height: u32) -> bool {
        self.requests
            .range(..=height)
            .next_back()
            .map_or(false, |(start, request)| height < start + request.count)
    }

    fn connect_buffered(&mut self) {
        loop {
            if self.halt.is_halted() {
                return;
            }
            let tip = self.committer.store().tip();
            let Some((origin, block)) = self.blocks.remove(&(tip.height + 1)) else {
                return;
            };
            if block.header.prev_hash != tip.hash {
                self.fork(&origin, tip.height, tip.hash, block.header.prev_hash);
                return;
            }
            match self.committer.connect_block(&block) {
                Ok(()) => {
                    if let Some(pool) = &self.pool {
                        pool.remove_block(&block, self.committer.store());
                    }
                    log::info!("CommitBlock, {}, {}, synced", block.height(), block.hash());
                    Event::publish(
                        &self.event_publisher,
                        Event::CommitBlock(CommitBlockEvent {
                            timestamp: SystemTime::now(),
                            height: block.height(),
                            block: block.hash(),
                            transactions: block.body.transactions.len(),
                        }),
                    );
                }
                // Another thread of this role committed the block first.
                Err(ChainError::InvalidHeight { .. })
                | Err(ChainError::Store(StoreError::InvalidAppendHeight { .. })) => (),
                Err(err) if err.is_fatal() => {
                    self.halt.raise(ConsensusError::Chain(err));
                    return;
                }
                Err(err) => {
                    log::debug!("InvalidSyncedBlock, {}, {}, {}", origin, block.height(), err);
                    penalize(
                        &mut self.mesh,
                        &origin,
                        INVALID_BLOCK_POINTS,
                        &err.to_string(),
                        &self.event_publisher,
                    );
                    self.requests.remove(&block.height());
                    return;
                }
            }
        }
    }

    fn fork(&mut self, peer: &PublicKey, height: u32, local: Hash256, remote: Hash256) {
        remove_peer(
            &mut self.mesh,
            peer,
            &format!("forked at height {}", height),
            &self.event_publisher,
        );
        self.statuses.remove(peer);
        self.requests.retain(|_, request| request.peer != *peer);
        self.blocks.retain(|_, (origin, _)| origin != peer);
        Event::publish(
            &self.event_publisher,
            Event::ForkDetected(ForkDetectedEvent {
                timestamp: SystemTime::now(),
                peer: *peer,
                height,
                local,
                remote,
            }),
        );
        self.halt.raise(ConsensusError::FoundForkedBlock {
            peer: *peer,
            height,
            local,
            remote,
        });
    }
}
