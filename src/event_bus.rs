/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that fires user-registered (and default logging) handlers for every [event](crate::events)
//! a role publishes.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Handlers for every event type, in registration order. The default logger, if enabled, runs first.
#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) commit_block_handlers: Vec<HandlerPtr<CommitBlockEvent>>,
    pub(crate) produce_block_handlers: Vec<HandlerPtr<ProduceBlockEvent>>,
    pub(crate) receive_block_gen_handlers: Vec<HandlerPtr<ReceiveBlockGenEvent>>,
    pub(crate) dead_letter_handlers: Vec<HandlerPtr<DeadLetterEvent>>,
    pub(crate) expire_transactions_handlers: Vec<HandlerPtr<ExpireTransactionsEvent>>,
    pub(crate) round_vote_handlers: Vec<HandlerPtr<RoundVoteEvent>>,
    pub(crate) round_vote_ack_handlers: Vec<HandlerPtr<RoundVoteAckEvent>>,
    pub(crate) block_vote_handlers: Vec<HandlerPtr<BlockVoteEvent>>,
    pub(crate) generator_timeout_handlers: Vec<HandlerPtr<GeneratorTimeoutEvent>>,
    pub(crate) request_blocks_handlers: Vec<HandlerPtr<RequestBlocksEvent>>,
    pub(crate) serve_blocks_handlers: Vec<HandlerPtr<ServeBlocksEvent>>,
    pub(crate) fork_detected_handlers: Vec<HandlerPtr<ForkDetectedEvent>>,
    pub(crate) remove_peer_handlers: Vec<HandlerPtr<RemovePeerEvent>>,
}

/// Push the default logger (if `log_events`) and then the user's handler (if any) onto `handlers`.
fn register<T: Logger>(handlers: &mut Vec<HandlerPtr<T>>, log_events: bool, handler: Option<HandlerPtr<T>>) {
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(handler) = handler {
        handlers.push(handler);
    }
}

/// The user handlers a role spec collected, one optional handler per event type.
#[derive(Default)]
pub(crate) struct UserHandlers {
    pub(crate) on_commit_block: Option<HandlerPtr<CommitBlockEvent>>,
    pub(crate) on_produce_block: Option<HandlerPtr<ProduceBlockEvent>>,
    pub(crate) on_receive_block_gen: Option<HandlerPtr<ReceiveBlockGenEvent>>,
    pub(crate) on_dead_letter: Option<HandlerPtr<DeadLetterEvent>>,
    pub(crate) on_expire_transactions: Option<HandlerPtr<ExpireTransactionsEvent>>,
    pub(crate) on_round_vote: Option<HandlerPtr<RoundVoteEvent>>,
    pub(crate) on_round_vote_ack: Option<HandlerPtr<RoundVoteAckEvent>>,
    pub(crate) on_block_vote: Option<HandlerPtr<BlockVoteEvent>>,
    pub(crate) on_generator_timeout: Option<HandlerPtr<GeneratorTimeoutEvent>>,
    pub(crate) on_request_blocks: Option<HandlerPtr<RequestBlocksEvent>>,
    pub(crate) on_serve_blocks: Option<HandlerPtr<ServeBlocksEvent>>,
    pub(crate) on_fork_detected: Option<HandlerPtr<ForkDetectedEvent>>,
    pub(crate) on_remove_peer: Option<HandlerPtr<RemovePeerEvent>>,
}

impl EventHandlers {
    pub(crate) fn new(log_events: bool, user: UserHandlers) -> EventHandlers {
        let mut handlers = EventHandlers::default();
        register(&mut handlers.commit_block_handlers, log_events, user.on_commit_block);
        register(&mut handlers.produce_block_handlers, log_events, user.on_produce_block);
        register(&mut handlers.receive_block_gen_handlers, log_events, user.on_receive_block_gen);
        register(&mut handlers.dead_letter_handlers, log_events, user.on_dead_letter);
        register(&mut handlers.expire_transactions_handlers, log_events, user.on_expire_transactions);
        register(&mut handlers.round_vote_handlers, log_events, user.on_round_vote);
        register(&mut handlers.round_vote_ack_handlers, log_events, user.on_round_vote_ack);
        register(&mut handlers.block_vote_handlers, log_events, user.on_block_vote);
        register(&mut handlers.generator_timeout_handlers, log_events, user.on_generator_timeout);
        register(&mut handlers.request_blocks_handlers, log_events, user.on_request_blocks);
        register(&mut handlers.serve_blocks_handlers, log_events, user.on_serve_blocks);
        register(&mut handlers.fork_detected_handlers, log_events, user.on_fork_detected);
        register(&mut handlers.remove_peer_handlers, log_events, user.on_remove_peer);
        handlers
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.commit_block_handlers.is_empty()
            && self.produce_block_handlers.is_empty()
            && self.receive_block_gen_handlers.is_empty()
            && self.dead_letter_handlers.is_empty()
            && self.expire_transactions_handlers.is_empty()
            && self.round_vote_handlers.is_empty()
            && self.round_vote_ack_handlers.is_empty()
            && self.block_vote_handlers.is_empty()
            && self.generator_timeout_handlers.is_empty()
            && self.request_blocks_handlers.is_empty()
            && self.serve_blocks_handlers.is_empty()
            && self.fork_detected_handlers.is_empty()
            && self.remove_peer_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::CommitBlock(event) => self.commit_block_handlers.iter().for_each(|handler| handler(&event)),
            Event::ProduceBlock(event) => self.produce_block_handlers.iter().for_each(|handler| handler(&event)),
            Event::ReceiveBlockGen(event) => {
                self.receive_block_gen_handlers.iter().for_each(|handler| handler(&event))
            }
            Event::DeadLetter(event) => self.dead_letter_handlers.iter().for_each(|handler| handler(&event)),
            Event::ExpireTransactions(event) => {
                self.expire_transactions_handlers.iter().for_each(|handler| handler(&event))
            }
            Event::RoundVote(event) => self.round_vote_handlers.iter().for_each(|handler| handler(&event)),
            Event::RoundVoteAck(event) => self.round_vote_ack_handlers.iter().for_each(|handler| handler(&event)),
            Event::BlockVote(event) => self.block_vote_handlers.iter().for_each(|handler| handler(&event)),
            Event::GeneratorTimeout(event) => {
                self.generator_timeout_handlers.iter().for_each(|handler| handler(&event))
            }
            Event::RequestBlocks(event) => self.request_blocks_handlers.iter().for_each(|handler| handler(&event)),
            Event::ServeBlocks(event) => self.serve_blocks_handlers.iter().for_each(|handler| handler(&event)),
            Event::ForkDetected(event) => self.fork_detected_handlers.iter().for_each(|handler| handler(&event)),
            Event::RemovePeer(event) => self.remove_peer_handlers.iter().for_each(|handler| handler(&event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Event bus thread disconnected from main thread")
            }
        }

        match event_subscriber.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher is gone; wait for the shutdown signal.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(50)),
        }
    })
}
