/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the node's
//! [configuration](crate::node::NodeConfiguration).
//!
//! tendermint_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [Vote](crate::events::VoteEvent) is printed:
//!
//! ```text
//! Vote, 1701329264, 5, 0, Prevote, Id5u7f6, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third and fourth values are the height and round of the vote.
//! - The fifth value is the type of the vote.
//! - The sixth value is the first seven characters of the Base64 encoding of the address of the
//!   validator that signed the vote.
//! - The seventh value is the first seven characters of the Base64 encoding of the hash of the block
//!   voted for, or `nil`.

use crate::events::*;
use crate::types::basic::{Height, Round, Step};
use crate::types::block::BlockID;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;
use std::time::SystemTime;

// Names of each event in PascalCase for printing:
pub const NEW_ROUND_STEP: &str = "NewRoundStep";
pub const NEW_ROUND: &str = "NewRound";
pub const COMPLETE_PROPOSAL: &str = "CompleteProposal";
pub const NEW_VALID_BLOCK: &str = "NewValidBlock";
pub const TIMEOUT_PROPOSE: &str = "TimeoutPropose";
pub const TIMEOUT_WAIT: &str = "TimeoutWait";

pub const VOTE: &str = "Vote";
pub const POLKA: &str = "Polka";
pub const LOCK: &str = "Lock";
pub const UNLOCK: &str = "Unlock";
pub const RELOCK: &str = "Relock";
pub const CONFLICTING_VOTES: &str = "ConflictingVotes";

pub const NEW_BLOCK: &str = "NewBlock";
pub const NEW_BLOCK_HEADER: &str = "NewBlockHeader";
pub const VALIDATOR_SET_UPDATES: &str = "ValidatorSetUpdates";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for NewRoundStepEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_round_step_event: &NewRoundStepEvent| {
            log_round_step(
                NEW_ROUND_STEP,
                new_round_step_event.timestamp,
                new_round_step_event.height,
                new_round_step_event.round,
                new_round_step_event.step,
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewRoundEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_round_event: &NewRoundEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_ROUND,
                secs_since_unix_epoch(new_round_event.timestamp),
                new_round_event.height,
                new_round_event.round,
                first_seven_base64_chars(&new_round_event.proposer.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CompleteProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |complete_proposal_event: &CompleteProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                COMPLETE_PROPOSAL,
                secs_since_unix_epoch(complete_proposal_event.timestamp),
                complete_proposal_event.height,
                complete_proposal_event.round,
                first_seven_base64_chars(&complete_proposal_event.block_id.hash.bytes()),
                complete_proposal_event.block_id.parts_header.total
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewValidBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_valid_block_event: &NewValidBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                NEW_VALID_BLOCK,
                secs_since_unix_epoch(new_valid_block_event.timestamp),
                new_valid_block_event.height,
                new_valid_block_event.round,
                first_seven_base64_chars(&new_valid_block_event.block_parts_header.hash.bytes()),
                new_valid_block_event.is_commit
            )
        };
        Box::new(logger)
    }
}

impl Logger for TimeoutProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |timeout_propose_event: &TimeoutProposeEvent| {
            log_round_step(
                TIMEOUT_PROPOSE,
                timeout_propose_event.timestamp,
                timeout_propose_event.height,
                timeout_propose_event.round,
                timeout_propose_event.step,
            )
        };
        Box::new(logger)
    }
}

impl Logger for TimeoutWaitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |timeout_wait_event: &TimeoutWaitEvent| {
            log_round_step(
                TIMEOUT_WAIT,
                timeout_wait_event.timestamp,
                timeout_wait_event.height,
                timeout_wait_event.round,
                timeout_wait_event.step,
            )
        };
        Box::new(logger)
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |vote_event: &VoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                VOTE,
                secs_since_unix_epoch(vote_event.timestamp),
                vote_event.vote.height,
                vote_event.vote.round,
                vote_event.vote.vote_type,
                first_seven_base64_chars(&vote_event.vote.validator_address.bytes()),
                block_id_info(&vote_event.vote.block_id)
            )
        };
        Box::new(logger)
    }
}

impl Logger for PolkaEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |polka_event: &PolkaEvent| {
            log_round_step(
                POLKA,
                polka_event.timestamp,
                polka_event.height,
                polka_event.round,
                polka_event.step,
            )
        };
        Box::new(logger)
    }
}

impl Logger for LockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |lock_event: &LockEvent| {
            log_round_step(
                LOCK,
                lock_event.timestamp,
                lock_event.height,
                lock_event.round,
                lock_event.step,
            )
        };
        Box::new(logger)
    }
}

impl Logger for UnlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |unlock_event: &UnlockEvent| {
            log_round_step(
                UNLOCK,
                unlock_event.timestamp,
                unlock_event.height,
                unlock_event.round,
                unlock_event.step,
            )
        };
        Box::new(logger)
    }
}

impl Logger for RelockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |relock_event: &RelockEvent| {
            log_round_step(
                RELOCK,
                relock_event.timestamp,
                relock_event.height,
                relock_event.round,
                relock_event.step,
            )
        };
        Box::new(logger)
    }
}

impl Logger for ConflictingVotesEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |conflicting_votes_event: &ConflictingVotesEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}, {}, {}, {}",
                CONFLICTING_VOTES,
                secs_since_unix_epoch(conflicting_votes_event.timestamp),
                conflicting_votes_event.vote_a.height,
                conflicting_votes_event.vote_a.round,
                conflicting_votes_event.vote_a.vote_type,
                first_seven_base64_chars(&conflicting_votes_event.vote_a.validator_address.bytes()),
                block_id_info(&conflicting_votes_event.vote_a.block_id),
                block_id_info(&conflicting_votes_event.vote_b.block_id)
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_block_event: &NewBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_BLOCK,
                secs_since_unix_epoch(new_block_event.timestamp),
                new_block_event.block.height(),
                first_seven_base64_chars(&new_block_event.block.hash().bytes()),
                new_block_event.block.txs.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewBlockHeaderEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_block_header_event: &NewBlockHeaderEvent| {
            log::info!(
                "{}, {}, {}, {}",
                NEW_BLOCK_HEADER,
                secs_since_unix_epoch(new_block_header_event.timestamp),
                new_block_header_event.header.height,
                first_seven_base64_chars(&new_block_header_event.header.hash().bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ValidatorSetUpdatesEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |validator_set_updates_event: &ValidatorSetUpdatesEvent| {
            let updates: Vec<String> = validator_set_updates_event
                .validator_updates
                .iter()
                .map(|update| {
                    format!(
                        "{}: {}",
                        first_seven_base64_chars(&update.pub_key.address().bytes()),
                        update.power.int()
                    )
                })
                .collect();
            log::info!(
                "{}, {}, {}, [{}]",
                VALIDATOR_SET_UPDATES,
                secs_since_unix_epoch(validator_set_updates_event.timestamp),
                validator_set_updates_event.height,
                updates.join(" ")
            )
        };
        Box::new(logger)
    }
}

fn log_round_step(name: &str, timestamp: SystemTime, height: Height, round: Round, step: Step) {
    log::info!(
        "{}, {}, {}, {}, {}",
        name,
        secs_since_unix_epoch(timestamp),
        height,
        round,
        step
    )
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

fn block_id_info(block_id: &Option<BlockID>) -> String {
    match block_id {
        Some(block_id) => first_seven_base64_chars(&block_id.hash.bytes()),
        None => String::from("nil"),
    }
}
