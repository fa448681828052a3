/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The observer's state mutator: the single thread that drives the [`VoteRound`].
//!
//! ## Round
//!
//! 1. **RoundVote.** Every observer broadcasts a [`RoundVoteMessage`] naming the generator it wants for
//!    the target height, which is the top of the rank table after the smallest timeout count whose
//!    generator is connected and not ignored. Once [`round_vote_quorum`] votes arrived, the observer
//!    moves on.
//! 2. **RoundVoteAck.** The observer acks the smallest vote (by timeout count, then public key), which
//!    nominates the observer that cast it. Once a [`majority`] of acks agree on one nomination, it is
//!    adopted.
//! 3. **BlockWait.** The nominated observer sends a [`BlockReqMessage`] to the generator. Every observer
//!    waits for the generated block, relays it once to its peers, executes it, and checks its context
//!    hash.
//! 4. **BlockVote.** Observers broadcast their signature over the block. Once a majority signed, the
//!    block is committed with exactly a majority of observer signatures, and the signatures are sent to
//!    the generators. If the generator's turn has blocks left, the round goes back to BlockWait for the
//!    next height. Otherwise a new round starts.
//!
//! ## Failure
//!
//! Every [`VOTE_TICK`] without progress increments the round's vote fail count. Past
//! [`MAX_VOTE_FAIL_COUNT`], a round waiting on a generator ignores that generator for
//! [`GENERATOR_IGNORE_DURATION`] (disconnecting it the second time), and the round restarts. The
//! nominated observer first sends the generator a [`BlockRevokeMessage`] so it stops producing.

use std::{
    collections::{BTreeSet, HashMap},
    sync::mpsc::{Receiver, Sender, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crate::{
    context::committer::Committer,
    events::{
        BlockVoteEvent, CommitBlockEvent, Event, GeneratorTimeoutEvent, ReceiveBlockGenEvent,
        RoundVoteAckEvent, RoundVoteEvent,
    },
    networking::{
        codec::{encode_packet, Envelope},
        generator_service::GeneratorGate,
        mesh::{penalize, Mesh},
    },
    store::pluggables::KVStore,
    sync::messages::StatusMessage,
    types::{
        crypto_primitives::{recover_address, recover_public_key, Keypair},
        data_types::{Address, PublicKey, Signature},
        transaction::unix_nanos,
    },
};

use super::{
    errors::{ConsensusError, Halt},
    messages::{
        observer_sign_digest, BlockGenMessage, BlockObSignMessage, BlockReqMessage, BlockRevokeMessage,
        BlockVoteMessage, RoundVoteAckMessage, RoundVoteMessage,
    },
    pof::{majority, round_vote_quorum, ConsensusData},
    rank_table::RankTable,
    vote_round::{RoundState, VoteRound},
};

pub const VOTE_TICK: Duration = Duration::from_millis(100);
pub const MAX_VOTE_FAIL_COUNT: u32 = 20;
pub const GENERATOR_IGNORE_DURATION: Duration = Duration::from_secs(10);
/// How long the nominated observer waits for a generated block before asking again.
pub const BLOCK_REQUEST_INTERVAL: Duration = Duration::from_secs(1);
const INVALID_VOTE_POINTS: u32 = 5;

struct Ignore {
    until: Instant,
    strikes: u32,
}

pub(crate) struct Observer<K: KVStore, O: Mesh, G: GeneratorGate> {
    keypair: Keypair,
    public_key: PublicKey,
    observers: BTreeSet<PublicKey>,
    committer: Committer<K>,
    observer_mesh: O,
    generator_mesh: G,
    round: VoteRound,
    ignored: HashMap<Address, Ignore>,
    status_interval: Duration,
    last_status: Instant,
    halt: Halt,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore, O: Mesh, G: GeneratorGate> Observer<K, O, G> {
    pub(crate) fn new(
        keypair: Keypair,
        observers: BTreeSet<PublicKey>,
        committer: Committer<K>,
        observer_mesh: O,
        generator_mesh: G,
        status_interval: Duration,
        halt: Halt,
        event_publisher: Option<Sender<Event>>,
    ) -> Observer<K, O, G> {
        let tip = committer.store().tip();
        let round = VoteRound::new(
            tip.height + 1,
            tip.hash,
            committer.params().max_blocks_per_generator,
        );
        Observer {
            public_key: keypair.public(),
            keypair,
            observers,
            committer,
            observer_mesh,
            generator_mesh,
            round,
            ignored: HashMap::new(),
            status_interval,
            last_status: Instant::now(),
            halt,
            event_publisher,
        }
    }

    pub(crate) fn start(
        mut self,
        observer_messages: Receiver<(PublicKey, Envelope)>,
        generator_messages: Receiver<(PublicKey, Envelope)>,
        shutdown_signal: Receiver<()>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            self.refresh_generators();
            self.new_round();
            let mut last_tick = Instant::now();
            loop {
                match shutdown_signal.try_recv() {
                    Ok(()) => return,
                    Err(TryRecvError::Empty) => (),
                    Err(TryRecvError::Disconnected) => {
                        panic!("Observer thread disconnected from main thread")
                    }
                }
                if self.halt.is_halted() {
                    thread::sleep(VOTE_TICK);
                    continue;
                }

                let mut idle = true;
                if let Ok((origin, envelope)) = observer_messages.try_recv() {
                    self.on_observer_message(&origin, &envelope);
                    idle = false;
                }
                if let Ok((origin, envelope)) = generator_messages.try_recv() {
                    self.on_generator_message(&origin, &envelope);
                    idle = false;
                }

                // The sync client may have committed past the round.
                if self.committer.store().height() >= self.round.current_height {
                    self.new_round();
                }

                if last_tick.elapsed() >= VOTE_TICK {
                    self.on_tick();
                    last_tick = Instant::now();
                }
                if idle {
                    thread::sleep(Duration::from_millis(2));
                }
            }
        })
    }

    fn on_observer_message(&mut self, origin: &PublicKey, envelope: &Envelope) {
        let result = if envelope.is::<RoundVoteMessage>() {
            envelope
                .parse::<RoundVoteMessage>()
                .map_err(|_| ConsensusError::InvalidVote)
                .and_then(|vote| self.on_round_vote(origin, vote))
        } else if envelope.is::<RoundVoteAckMessage>() {
            envelope
                .parse::<RoundVoteAckMessage>()
                .map_err(|_| ConsensusError::InvalidVote)
                .and_then(|ack| self.on_round_vote_ack(origin, ack))
        } else if envelope.is::<BlockVoteMessage>() {
            envelope
                .parse::<BlockVoteMessage>()
                .map_err(|_| ConsensusError::InvalidVote)
                .and_then(|vote| self.on_block_vote(origin, vote))
        } else if envelope.is::<BlockGenMessage>() {
            envelope
                .parse::<BlockGenMessage>()
                .map_err(|_| ConsensusError::InvalidVote)
                .and_then(|message| self.on_block_gen(origin, message, false))
        } else if envelope.is::<BlockReqMessage>() {
            envelope
                .parse::<BlockReqMessage>()
                .map_err(|_| ConsensusError::InvalidVote)
                .map(|request| self.relay_block_request(origin, request))
        } else if envelope.is::<BlockRevokeMessage>() {
            envelope
                .parse::<BlockRevokeMessage>()
                .map_err(|_| ConsensusError::InvalidVote)
                .map(|message| self.relay_block_revoke(origin, message))
        } else {
            Ok(())
        };
        self.on_result(origin, envelope, result);
    }

    fn on_generator_message(&mut self, origin: &PublicKey, envelope: &Envelope) {
        let result = if envelope.is::<BlockGenMessage>() {
            envelope
                .parse::<BlockGenMessage>()
                .map_err(|_| ConsensusError::InvalidVote)
                .and_then(|message| self.on_block_gen(origin, message, true))
        } else if envelope.is::<StatusMessage>() {
            if let Ok(status) = envelope.parse::<StatusMessage>() {
                if status.height < self.committer.store().height() {
                    let packet = self.status_packet();
                    self.generator_mesh.send_to(origin, &packet);
                }
            }
            Ok(())
        } else {
            Ok(())
        };
        self.on_result(origin, envelope, result);
    }

    fn on_result(&mut self, origin: &PublicKey, envelope: &Envelope, result: Result<(), ConsensusError>) {
        match result {
            Ok(()) => (),
            Err(ConsensusError::InvalidVote) => {
                log::debug!("InvalidVote, {}, {}", envelope.type_name(), origin);
                if self.observers.contains(origin) {
                    penalize(
                        &mut self.observer_mesh,
                        origin,
                        INVALID_VOTE_POINTS,
                        "invalid vote",
                        &self.event_publisher,
                    );
                } else {
                    penalize(
                        &mut self.generator_mesh,
                        origin,
                        INVALID_VOTE_POINTS,
                        "invalid block",
                        &self.event_publisher,
                    );
                }
            }
            Err(ConsensusError::Chain(err)) if err.is_fatal() => {
                self.halt.raise(ConsensusError::Chain(err))
            }
            Err(err) => log::debug!("Reject, {}, {}, {}", envelope.type_name(), origin, err),
        }
    }

    /* ↓↓↓ RoundVote ↓↓↓ */

    /// Drop the current round and open one for the block after the store's tip.
    ///
    /// Votes and acks peers already sent for the same target are carried over, unless they name a
    /// generator this observer now ignores. Peers that timed out earlier will not send them again.
    fn new_round(&mut self) {
        let tip = self.committer.store().tip();
        let max_blocks = self.committer.params().max_blocks_per_generator;
        let previous = std::mem::replace(
            &mut self.round,
            VoteRound::new(tip.height + 1, tip.hash, max_blocks),
        );
        if previous.target_height == self.round.target_height && previous.last_hash == tip.hash {
            let public_key = self.public_key;
            let now = Instant::now();
            let ignored = &self.ignored;
            let keep = |peer: &PublicKey, generator: &Address| {
                *peer != public_key && ignored.get(generator).map_or(true, |ignore| ignore.until <= now)
            };
            self.round.round_votes = previous
                .round_votes
                .into_iter()
                .filter(|(peer, vote)| keep(peer, &vote.generator))
                .collect();
            self.round.ack_wait = previous
                .acks
                .into_iter()
                .chain(previous.ack_wait)
                .filter(|(peer, ack)| keep(peer, &ack.generator))
                .collect();
        }

        let table = match RankTable::from_store(self.committer.store()) {
            Ok(table) => table,
            Err(err) => {
                log::warn!("NewRound, {}", err);
                return;
            }
        };
        let timeout_count = self.choose_timeout_count(&table);
        let Some(generator) = table.top(timeout_count) else {
            log::warn!("NewRound, empty rank table");
            return;
        };
        let vote = RoundVoteMessage {
            chain_id: self.committer.params().chain_id,
            last_hash: tip.hash,
            target_height: self.round.target_height,
            timeout_count,
            generator,
            public_key: self.public_key,
            timestamp: unix_nanos(),
        };
        self.observer_mesh.broadcast(&encode_packet(&vote));
        self.round.round_votes.insert(self.public_key, vote);
        Event::publish(
            &self.event_publisher,
            Event::RoundVote(RoundVoteEvent {
                timestamp: SystemTime::now(),
                target_height: self.round.target_height,
                timeout_count,
                generator,
            }),
        );
        self.check_round_votes();
    }

    /// The smallest timeout count whose generator is connected and not ignored. Falls back to the
    /// smallest one that is not ignored, then to zero.
    fn choose_timeout_count(&self, table: &RankTable) -> u32 {
        let connected: Vec<Address> = self
            .generator_mesh
            .peers()
            .iter()
            .filter_map(|peer| Address::from_public_key(peer).ok())
            .collect();
        let candidates = 0..table.len() as u32;
        let usable = |k: &u32| table.top(*k).map_or(false, |generator| !self.is_ignored(&generator));
        candidates
            .clone()
            .filter(usable)
            .find(|k| table.top(*k).map_or(false, |generator| connected.contains(&generator)))
            .or_else(|| candidates.clone().find(usable))
            .unwrap_or(0)
    }

    fn is_ignored(&self, generator: &Address) -> bool {
        self.ignored
            .get(generator)
            .map_or(false, |ignore| ignore.until > Instant::now())
    }

    fn on_round_vote(&mut self, origin: &PublicKey, vote: RoundVoteMessage) -> Result<(), ConsensusError> {
        if vote.chain_id != self.committer.params().chain_id
            || vote.public_key != *origin
            || !self.observers.contains(origin)
        {
            return Err(ConsensusError::InvalidVote);
        }
        if vote.target_height < self.round.target_height {
            let packet = self.status_packet();
            self.observer_mesh.send_to(origin, &packet);
            return Ok(());
        }
        if vote.target_height > self.round.target_height {
            return Err(ConsensusError::InvalidRoundState);
        }
        if vote.last_hash != self.round.last_hash {
            return Err(ConsensusError::InvalidVote);
        }

        let first = match self.round.round_votes.get(origin) {
            Some(existing) if existing.timestamp >= vote.timestamp => {
                return Err(ConsensusError::AlreadyVoted(*origin))
            }
            Some(_) => false,
            None => true,
        };
        self.round.round_votes.insert(*origin, vote);

        if self.round.state == RoundState::RoundVote {
            self.check_round_votes();
        } else if first {
            // A late observer: give it what it missed.
            if let Some(own_vote) = self.round.round_votes.get(&self.public_key) {
                self.observer_mesh.send_to(origin, &encode_packet(own_vote));
            }
            if let Some(own_ack) = self.round.acks.get(&self.public_key) {
                self.observer_mesh.send_to(origin, &encode_packet(own_ack));
            }
        }
        Ok(())
    }

    fn check_round_votes(&mut self) {
        if self.round.state != RoundState::RoundVote
            || self.round.round_votes.len() < round_vote_quorum(self.observers.len())
        {
            return;
        }
        let Some(min_vote) = self.round.min_round_vote(|generator| self.is_ignored(generator)) else {
            return;
        };
        let ack = RoundVoteAckMessage {
            chain_id: min_vote.chain_id,
            last_hash: min_vote.last_hash,
            target_height: min_vote.target_height,
            timeout_count: min_vote.timeout_count,
            generator: min_vote.generator,
            nominated: min_vote.public_key,
            public_key: self.public_key,
            timestamp: unix_nanos(),
        };

        self.round.state = RoundState::RoundVoteAck;
        self.round.vote_fail_count = 0;
        self.observer_mesh.broadcast(&encode_packet(&ack));
        Event::publish(
            &self.event_publisher,
            Event::RoundVoteAck(RoundVoteAckEvent {
                timestamp: SystemTime::now(),
                target_height: ack.target_height,
                timeout_count: ack.timeout_count,
                nominated: ack.nominated,
            }),
        );
        self.round.acks.insert(self.public_key, ack);
        let waiting = std::mem::take(&mut self.round.ack_wait);
        self.round.acks.extend(waiting);
        self.check_round_vote_acks();
    }

    /* ↓↓↓ RoundVoteAck ↓↓↓ */

    fn on_round_vote_ack(
        &mut self,
        origin: &PublicKey,
        ack: RoundVoteAckMessage,
    ) -> Result<(), ConsensusError> {
        if ack.chain_id != self.committer.params().chain_id
            || ack.public_key != *origin
            || !self.observers.contains(origin)
            || !self.observers.contains(&ack.nominated)
        {
            return Err(ConsensusError::InvalidVote);
        }
        if ack.target_height < self.round.target_height {
            let packet = self.status_packet();
            self.observer_mesh.send_to(origin, &packet);
            return Ok(());
        }
        if ack.target_height > self.round.target_height {
            return Err(ConsensusError::InvalidRoundState);
        }
        if ack.last_hash != self.round.last_hash {
            return Err(ConsensusError::InvalidVote);
        }

        match self.round.state {
            RoundState::RoundVote => {
                self.round.ack_wait.insert(*origin, ack);
                Ok(())
            }
            RoundState::RoundVoteAck => {
                if let Some(existing) = self.round.acks.get(origin) {
                    if existing.timestamp >= ack.timestamp {
                        return Err(ConsensusError::AlreadyVoted(*origin));
                    }
                }
                self.round.acks.insert(*origin, ack);
                self.check_round_vote_acks();
                Ok(())
            }
            RoundState::BlockWait | RoundState::BlockVote => Err(ConsensusError::InvalidRoundState),
        }
    }

    fn check_round_vote_acks(&mut self) {
        if self.round.state != RoundState::RoundVoteAck {
            return;
        }
        let Some(agreed) = self.round.agreed_ack(majority(self.observers.len())).cloned() else {
            return;
        };
        log::debug!(
            "MinRoundVoteAck, {}, {}, {}, {}",
            agreed.target_height,
            agreed.timeout_count,
            agreed.generator,
            agreed.nominated
        );
        let nominated = agreed.nominated;
        self.round.min_ack = Some(agreed);
        self.round.state = RoundState::BlockWait;
        self.round.current_height = self.round.target_height;
        self.round.vote_fail_count = 0;
        if nominated == self.public_key {
            self.request_block();
        }
        self.drain_waiting();
    }

    /* ↓↓↓ BlockWait ↓↓↓ */

    /// The request for the agreed generator's turn, if the round got that far.
    fn block_request(&self) -> Option<BlockReqMessage> {
        self.round.min_ack.as_ref().map(|ack| BlockReqMessage {
            chain_id: ack.chain_id,
            prev_hash: self.round.last_hash,
            target_height: self.round.target_height,
            timeout_count: ack.timeout_count,
            generator: ack.generator,
        })
    }

    fn request_block(&mut self) {
        let Some(request) = self.block_request() else {
            return;
        };
        if let Some(block_round) = self.round.block_round_mut(self.round.target_height) {
            block_round.last_request = Some(Instant::now());
        }
        self.send_to_generator(&request.generator, &encode_packet(&request));
    }

    /// Tell the generator to stop the turn this observer requested.
    fn revoke_block_request(&mut self) {
        let Some(request) = self.block_request() else {
            return;
        };
        log::debug!("BlockRevoke, {}, {}", request.target_height, request.generator);
        let generator = request.generator;
        self.send_to_generator(&generator, &encode_packet(&BlockRevokeMessage { request }));
    }

    /// Send `packet` over the generator link, or through any observer if there is none.
    fn send_to_generator(&mut self, generator: &Address, packet: &[u8]) {
        match self.generator_peer(generator) {
            Some(peer) => self.generator_mesh.send_to(&peer, packet),
            None => {
                if !self.observer_mesh.send_anyone(packet) {
                    log::debug!("BlockReq, {}, generator unreachable", generator);
                }
            }
        }
    }

    /// Pass on a block request from an observer that has no link to the generator.
    fn relay_block_request(&mut self, origin: &PublicKey, request: BlockReqMessage) {
        if request.chain_id != self.committer.params().chain_id || !self.observers.contains(origin) {
            return;
        }
        if let Some(peer) = self.generator_peer(&request.generator) {
            self.generator_mesh.send_to(&peer, &encode_packet(&request));
        }
    }

    fn relay_block_revoke(&mut self, origin: &PublicKey, message: BlockRevokeMessage) {
        if message.request.chain_id != self.committer.params().chain_id || !self.observers.contains(origin) {
            return;
        }
        if let Some(peer) = self.generator_peer(&message.request.generator) {
            self.generator_mesh.send_to(&peer, &encode_packet(&message));
        }
    }

    fn on_block_gen(
        &mut self,
        origin: &PublicKey,
        message: BlockGenMessage,
        from_generator: bool,
    ) -> Result<(), ConsensusError> {
        let header = &message.block.header;
        let height = header.height;
        if height < self.round.current_height {
            return Ok(());
        }
        if !self.round.is_in_turn(height) {
            return Err(ConsensusError::InvalidRoundState);
        }
        let generator_signature = message.generator_signature().ok_or(ConsensusError::InvalidVote)?;
        let header_hash = header.hash();
        if recover_address(&header_hash, generator_signature).ok() != Some(header.generator) {
            return Err(ConsensusError::InvalidVote);
        }
        if let Some(generator) = self.round.generator() {
            if header.generator != generator {
                return Err(ConsensusError::InvalidVote);
            }
        }

        let block_round = self
            .round
            .block_round_mut(height)
            .ok_or(ConsensusError::InvalidRoundState)?;
        if block_round.block_gen.is_some() || block_round.block_gen_wait.is_some() {
            return Ok(());
        }
        if !block_round.relayed {
            block_round.relayed = true;
            let packet = encode_packet(&message);
            if from_generator {
                self.observer_mesh.broadcast(&packet);
            } else {
                self.observer_mesh.except_cast(origin, &packet);
            }
            self.forward_to_next_generator(&message, &packet);
        }

        if self.round.state < RoundState::BlockWait || height != self.round.current_height {
            if let Some(block_round) = self.round.block_round_mut(height) {
                block_round.block_gen_wait = Some((*origin, message));
            }
            return Ok(());
        }
        self.execute_block_gen(origin, message)
    }

    /// The observer farthest (by xor distance) from the nominated one forwards generated blocks to the
    /// generator ranked after the current one, so it can catch up before its turn.
    fn forward_to_next_generator(&mut self, message: &BlockGenMessage, packet: &[u8]) {
        let Some(ack) = self.round.min_ack.as_ref() else {
            return;
        };
        let farthest = self
            .observers
            .iter()
            .filter(|observer| **observer != ack.nominated)
            .max_by_key(|observer| xor_distance(observer, &ack.nominated));
        if farthest != Some(&self.public_key) {
            return;
        }
        let next = match RankTable::from_store(self.committer.store()) {
            Ok(table) => table.top(ack.timeout_count + 1),
            Err(_) => None,
        };
        if let Some(next) = next.filter(|next| *next != message.block.header.generator) {
            if let Some(peer) = self.generator_peer(&next) {
                self.generator_mesh.send_to(&peer, packet);
            }
        }
    }

    fn execute_block_gen(&mut self, origin: &PublicKey, message: BlockGenMessage) -> Result<(), ConsensusError> {
        let height = message.block.height();
        let ctx = self.committer.new_context()?;
        let (ctx, receipts) = self.committer.execute_block(ctx, &message.block)?;

        let header_hash = message.block.hash();
        let generator_signature = *message
            .generator_signature()
            .ok_or(ConsensusError::InvalidVote)?;
        let vote = BlockVoteMessage {
            target_height: height,
            header_hash,
            observer_signature: self
                .keypair
                .sign(&observer_sign_digest(&header_hash, &generator_signature)),
            public_key: self.public_key,
        };

        let transactions = message.block.body.transactions.len();
        let block_round = self
            .round
            .block_round_mut(height)
            .ok_or(ConsensusError::InvalidRoundState)?;
        block_round.block_gen = Some(message);
        block_round.executed = Some((ctx, receipts));
        block_round.votes.insert(self.public_key, vote.clone());
        let waiting = std::mem::take(&mut block_round.vote_wait);
        self.round.state = RoundState::BlockVote;
        self.round.vote_fail_count = 0;

        log::debug!("ReceiveBlockGen, {}, {}, {}, {}", origin, height, header_hash, transactions);
        Event::publish(
            &self.event_publisher,
            Event::ReceiveBlockGen(ReceiveBlockGenEvent {
                timestamp: SystemTime::now(),
                origin: *origin,
                height,
                block: header_hash,
            }),
        );
        self.observer_mesh.broadcast(&encode_packet(&vote));
        Event::publish(
            &self.event_publisher,
            Event::BlockVote(BlockVoteEvent {
                timestamp: SystemTime::now(),
                height,
                block: header_hash,
            }),
        );

        for (peer, vote) in waiting {
            if let Err(err) = self.add_block_vote(vote) {
                log::debug!("Reject, BlockVoteMessage, {}, {}", peer, err);
            }
        }
        self.check_block_votes(height);
        Ok(())
    }

    /// Process a block that arrived before the round reached its height.
    fn drain_waiting(&mut self) {
        let height = self.round.current_height;
        let waiting = self
            .round
            .block_round_mut(height)
            .and_then(|block_round| block_round.block_gen_wait.take());
        if let Some((origin, message)) = waiting {
            if self.round.generator() != Some(message.block.header.generator) {
                log::debug!("Reject, BlockGenMessage, {}, not the agreed generator", origin);
                return;
            }
            if let Err(err) = self.execute_block_gen(&origin, message) {
                match err {
                    ConsensusError::Chain(err) if err.is_fatal() => {
                        self.halt.raise(ConsensusError::Chain(err))
                    }
                    err => log::debug!("Reject, BlockGenMessage, {}, {}", origin, err),
                }
            }
        }
    }

    /* ↓↓↓ BlockVote ↓↓↓ */

    fn on_block_vote(&mut self, origin: &PublicKey, vote: BlockVoteMessage) -> Result<(), ConsensusError> {
        if vote.public_key != *origin || !self.observers.contains(origin) {
            return Err(ConsensusError::InvalidVote);
        }
        if vote.target_height < self.round.current_height {
            return Ok(());
        }
        let height = vote.target_height;
        let block_round = self
            .round
            .block_round_mut(height)
            .ok_or(ConsensusError::InvalidRoundState)?;
        if block_round.block_gen.is_none() {
            block_round.vote_wait.insert(*origin, vote);
            return Ok(());
        }
        self.add_block_vote(vote)?;
        self.check_block_votes(height);
        Ok(())
    }

    fn add_block_vote(&mut self, vote: BlockVoteMessage) -> Result<(), ConsensusError> {
        let block_round = self
            .round
            .block_round_mut(vote.target_height)
            .ok_or(ConsensusError::InvalidRoundState)?;
        let message = block_round.block_gen.as_ref().ok_or(ConsensusError::InvalidRoundState)?;
        let header_hash = message.block.hash();
        if vote.header_hash != header_hash {
            return Err(ConsensusError::InvalidVote);
        }
        let generator_signature = message.generator_signature().ok_or(ConsensusError::InvalidVote)?;
        let signer = recover_public_key(
            &observer_sign_digest(&header_hash, generator_signature),
            &vote.observer_signature,
        )
        .map_err(|_| ConsensusError::InvalidVote)?;
        if signer != vote.public_key {
            return Err(ConsensusError::InvalidVote);
        }
        if block_round.votes.contains_key(&vote.public_key) {
            return Err(ConsensusError::AlreadyVoted(vote.public_key));
        }
        block_round.votes.insert(vote.public_key, vote);
        Ok(())
    }

    fn check_block_votes(&mut self, height: u32) {
        let majority = majority(self.observers.len());
        let ready = height == self.round.current_height
            && self.round.state == RoundState::BlockVote
            && self
                .round
                .block_round(height)
                .map_or(false, |block_round| block_round.votes.len() >= majority);
        if ready {
            self.commit(height, majority);
        }
    }

    fn commit(&mut self, height: u32, majority: usize) {
        let Some(block_round) = self.round.block_rounds.remove(&height) else {
            return;
        };
        let (Some(message), Some((ctx, receipts))) = (block_round.block_gen, block_round.executed) else {
            return;
        };
        let Some(generator_signature) = message.generator_signature().copied() else {
            return;
        };
        let mut block = message.block;
        let observer_signatures: Vec<Signature> = block_round
            .votes
            .values()
            .take(majority)
            .map(|vote| vote.observer_signature)
            .collect();
        block.body.block_signatures = std::iter::once(generator_signature)
            .chain(observer_signatures.iter().copied())
            .collect();

        if let Err(err) = self.committer.connect_block_with_context(&block, &ctx, &receipts) {
            if err.is_fatal() {
                self.halt.raise(ConsensusError::Chain(err));
            } else if self.committer.store().height() < height {
                log::warn!("CommitBlock, {}, {}", height, err);
                self.new_round();
            }
            return;
        }

        let header_hash = block.hash();
        log::info!(
            "CommitBlock, {}, {}, {}, {}",
            height,
            header_hash,
            block.header.generator,
            block.body.transactions.len()
        );
        Event::publish(
            &self.event_publisher,
            Event::CommitBlock(CommitBlockEvent {
                timestamp: SystemTime::now(),
                height,
                block: header_hash,
                transactions: block.body.transactions.len(),
            }),
        );
        self.ignored.remove(&block.header.generator);

        let status = self.status_packet();
        self.observer_mesh.broadcast(&status);
        self.generator_mesh.broadcast(&encode_packet(&BlockObSignMessage {
            height,
            header_hash,
            observer_signatures,
        }));
        self.generator_mesh.broadcast(&status);
        self.last_status = Instant::now();
        self.refresh_generators();

        let turn_index = ConsensusData::decode(&block.header.consensus_data)
            .map_or(u32::MAX, |data| data.turn_index);
        let turn_continues = turn_index.saturating_add(1) < self.committer.params().max_blocks_per_generator
            && self.round.is_in_turn(height + 1);
        if turn_continues {
            self.round.current_height = height + 1;
            self.round.state = RoundState::BlockWait;
            self.round.vote_fail_count = 0;
            self.drain_waiting();
        } else {
            self.new_round();
        }
    }

    /* ↓↓↓ Timers ↓↓↓ */

    fn on_tick(&mut self) {
        if self.last_status.elapsed() >= self.status_interval {
            let status = self.status_packet();
            self.generator_mesh.broadcast(&status);
            self.last_status = Instant::now();
        }

        let awaiting_first_block = self.round.state == RoundState::BlockWait
            && self.round.current_height == self.round.target_height
            && self.round.nominated() == Some(self.public_key);
        if awaiting_first_block {
            let due = self
                .round
                .block_round(self.round.target_height)
                .and_then(|block_round| block_round.last_request)
                .map_or(true, |at| at.elapsed() >= BLOCK_REQUEST_INTERVAL);
            if due {
                self.request_block();
            }
        }

        self.round.vote_fail_count += 1;
        if self.round.vote_fail_count <= MAX_VOTE_FAIL_COUNT {
            return;
        }
        match self.round.state {
            RoundState::RoundVote | RoundState::RoundVoteAck => {
                log::debug!("RoundTimeout, {}, {:?}", self.round.target_height, self.round.state);
            }
            RoundState::BlockWait | RoundState::BlockVote => {
                if self.round.nominated() == Some(self.public_key) {
                    self.revoke_block_request();
                }
                if let Some(generator) = self.round.generator() {
                    self.ignore_generator(generator);
                }
            }
        }
        self.new_round();
    }

    fn ignore_generator(&mut self, generator: Address) {
        let ignore = self.ignored.entry(generator).or_insert(Ignore {
            until: Instant::now(),
            strikes: 0,
        });
        ignore.strikes += 1;
        ignore.until = Instant::now() + GENERATOR_IGNORE_DURATION;
        let disconnected = ignore.strikes >= 2;
        if disconnected {
            if let Some(peer) = self.generator_peer(&generator) {
                self.generator_mesh.remove_peer(&peer);
            }
        }
        log::warn!(
            "GeneratorTimeout, {}, {}, {}",
            self.round.target_height,
            generator,
            disconnected
        );
        Event::publish(
            &self.event_publisher,
            Event::GeneratorTimeout(GeneratorTimeoutEvent {
                timestamp: SystemTime::now(),
                target_height: self.round.target_height,
                generator,
                disconnected,
            }),
        );
    }

    /* ↓↓↓ Helpers ↓↓↓ */

    fn generator_peer(&self, generator: &Address) -> Option<PublicKey> {
        self.generator_mesh
            .peers()
            .into_iter()
            .find(|peer| Address::from_public_key(peer).map_or(false, |address| address == *generator))
    }

    fn refresh_generators(&mut self) {
        match RankTable::from_store(self.committer.store()) {
            Ok(table) => self.generator_mesh.set_generators(table.addresses().collect()),
            Err(err) => log::warn!("RefreshGenerators, {}", err),
        }
    }

    fn status_packet(&self) -> Vec<u8> {
        let tip = self.committer.store().tip();
        encode_packet(&StatusMessage {
            height: tip.height,
            last_hash: tip.hash,
        })
    }
}

fn xor_distance(a: &PublicKey, b: &PublicKey) -> [u8; 33] {
    let mut distance = [0u8; 33];
    for (i, byte) in distance.iter_mut().enumerate() {
        *byte = a.bytes()[i] ^ b.bytes()[i];
    }
    distance
}
