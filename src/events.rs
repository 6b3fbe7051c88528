/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events emitted by the consensus engine, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Events are sent to the
//! [event bus](crate::event_bus) thread, which passes them to the handlers registered through
//! [NodeSpec](crate::node::NodeSpec) and, if enabled, to the default [loggers](crate::logging).

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::{
    basic::{Address, Height, Round, Step},
    block::{Block, BlockID, Header},
    part_set::PartSetHeader,
    validators::ValidatorUpdate,
    vote::Vote,
};

pub enum Event {
    // Events that mark progress through the steps of a round.
    NewRoundStep(NewRoundStepEvent),
    NewRound(NewRoundEvent),
    CompleteProposal(CompleteProposalEvent),
    NewValidBlock(NewValidBlockEvent),
    TimeoutPropose(TimeoutProposeEvent),
    TimeoutWait(TimeoutWaitEvent),
    // Events that involve votes and locks.
    Vote(VoteEvent),
    Polka(PolkaEvent),
    Lock(LockEvent),
    Unlock(UnlockEvent),
    Relock(RelockEvent),
    ConflictingVotes(ConflictingVotesEvent),
    // Events that involve committing a block.
    NewBlock(NewBlockEvent),
    NewBlockHeader(NewBlockHeaderEvent),
    ValidatorSetUpdates(ValidatorSetUpdatesEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus stops before the engine when a node shuts down.
            let _ = event_publisher.send(event);
        }
    }
}

pub struct NewRoundStepEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

pub struct NewRoundEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub proposer: Address,
}

pub struct CompleteProposalEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub block_id: BlockID,
}

/// The node saw a +2/3 prevote majority for a block it does not have yet, or the block of a commit.
pub struct NewValidBlockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub block_parts_header: PartSetHeader,
    pub is_commit: bool,
}

pub struct TimeoutProposeEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

pub struct TimeoutWaitEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

/// A vote was added to the node's vote sets.
pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub vote: Vote,
}

pub struct PolkaEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

pub struct LockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

pub struct UnlockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

pub struct RelockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

/// A validator signed two different votes for the same height, round, and vote type.
pub struct ConflictingVotesEvent {
    pub timestamp: SystemTime,
    pub vote_a: Vote,
    pub vote_b: Vote,
}

pub struct NewBlockEvent {
    pub timestamp: SystemTime,
    pub block: Block,
}

pub struct NewBlockHeaderEvent {
    pub timestamp: SystemTime,
    pub header: Header,
}

pub struct ValidatorSetUpdatesEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub validator_updates: Vec<ValidatorUpdate>,
}
