/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The mutable state of the round engine, and the read-only snapshot of it that other threads see.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    basic::{ChainID, CryptoHash, Height, Round, Step, Timestamp},
    bit_array::BitArray,
    block::{Block, BlockID},
    part_set::PartSet,
    proposal::Proposal,
    validators::ValidatorSet,
    vote_set::VoteSet,
};

use super::height_vote_set::HeightVoteSet;

/// A (height, round, step) triple. Ordered lexicographically.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, BorshSerialize, BorshDeserialize,
)]
pub struct HRS {
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

impl HRS {
    pub fn new(height: Height, round: Round, step: Step) -> HRS {
        HRS {
            height,
            round,
            step,
        }
    }
}

impl Display for HRS {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.height, self.round, self.step)
    }
}

/// Everything the engine knows about the height it is deciding.
///
/// `proposal_block_parts` is set as soon as a proposal is received, and `proposal_block` once all of its
/// parts have arrived. The same goes for the locked and valid blocks, except that these are always
/// complete.
pub struct RoundState {
    pub height: Height,
    pub round: Round,
    pub step: Step,
    /// When the current height's round 0 starts (or started).
    pub start_time: Timestamp,
    /// When +2/3 precommits for the previous height's block were seen.
    pub commit_time: Option<Timestamp>,
    pub validators: ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,
    pub locked_round: Option<Round>,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,
    /// The last round with a +2/3 prevote majority for a block this node has seen.
    pub valid_round: Option<Round>,
    pub valid_block: Option<Block>,
    pub valid_block_parts: Option<PartSet>,
    pub votes: HeightVoteSet,
    pub commit_round: Option<Round>,
    /// The precommits that decided the previous height. `None` at the first height.
    pub last_commit: Option<VoteSet>,
    pub last_validators: ValidatorSet,
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    pub(crate) fn new(chain_id: ChainID, height: Height, validators: ValidatorSet) -> RoundState {
        RoundState {
            height,
            round: Round::new(0),
            step: Step::NewHeight,
            start_time: Timestamp::now(),
            commit_time: None,
            votes: HeightVoteSet::new(chain_id, height, validators.clone()),
            validators,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: None,
            locked_block: None,
            locked_block_parts: None,
            valid_round: None,
            valid_block: None,
            valid_block_parts: None,
            commit_round: None,
            last_commit: None,
            last_validators: ValidatorSet::default(),
            triggered_timeout_precommit: false,
        }
    }

    pub fn hrs(&self) -> HRS {
        HRS::new(self.height, self.round, self.step)
    }

    /// The id of the proposal block, if it is complete.
    pub fn proposal_block_id(&self) -> Option<BlockID> {
        match (&self.proposal_block, &self.proposal_block_parts) {
            (Some(block), Some(parts)) => Some(BlockID::new(block.hash(), parts.header())),
            _ => None,
        }
    }

    pub fn last_commit_round(&self) -> Option<Round> {
        self.last_commit.as_ref().map(|last_commit| last_commit.round())
    }

    pub fn snapshot(&self) -> RoundStateSnapshot {
        RoundStateSnapshot {
            height: self.height,
            round: self.round,
            step: self.step,
            start_time: self.start_time,
            commit_time: self.commit_time,
            validators: self.validators.clone(),
            proposal: self.proposal.clone(),
            proposal_block_hash: self.proposal_block.as_ref().map(|block| block.hash()),
            locked_round: self.locked_round,
            locked_block_hash: self.locked_block.as_ref().map(|block| block.hash()),
            valid_round: self.valid_round,
            valid_block_hash: self.valid_block.as_ref().map(|block| block.hash()),
            commit_round: self.commit_round,
            last_commit_round: self.last_commit_round(),
            prevotes: self
                .votes
                .prevotes(self.round)
                .map(|prevotes| prevotes.bit_array()),
            precommits: self
                .votes
                .precommits(self.round)
                .map(|precommits| precommits.bit_array()),
            triggered_timeout_precommit: self.triggered_timeout_precommit,
        }
    }
}

impl Display for RoundState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let hash_or_nil = |block: &Option<Block>| {
            block
                .as_ref()
                .map_or(String::from("nil"), |block| block.hash().to_string())
        };
        write!(
            f,
            "RoundState{{{} proposal:{} locked:{:?}/{} valid:{:?}/{}}}",
            self.hrs(),
            hash_or_nil(&self.proposal_block),
            self.locked_round,
            hash_or_nil(&self.locked_block),
            self.valid_round,
            hash_or_nil(&self.valid_block),
        )
    }
}

/// A copy of the parts of a [RoundState] that outside observers care about. Republished by the engine
/// after every state transition.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RoundStateSnapshot {
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub start_time: Timestamp,
    pub commit_time: Option<Timestamp>,
    pub validators: ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_block_hash: Option<CryptoHash>,
    pub locked_round: Option<Round>,
    pub locked_block_hash: Option<CryptoHash>,
    pub valid_round: Option<Round>,
    pub valid_block_hash: Option<CryptoHash>,
    pub commit_round: Option<Round>,
    pub last_commit_round: Option<Round>,
    /// Which validators' prevotes for the current round the node has.
    pub prevotes: Option<BitArray>,
    /// Which validators' precommits for the current round the node has.
    pub precommits: Option<BitArray>,
    pub triggered_timeout_precommit: bool,
}

impl RoundStateSnapshot {
    pub fn hrs(&self) -> HRS {
        HRS::new(self.height, self.round, self.step)
    }
}
