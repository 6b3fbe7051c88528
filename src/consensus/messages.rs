/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged between consensus engines, and the inputs of the engine's receive loop.
//!
//! [ConsensusMessage] is the closed set of messages that peers gossip. Of these, proposals, block parts,
//! and votes drive the engine's state machine, and are therefore also written to the WAL (wrapped in a
//! [MsgInfo]). The others only update the reactor's view of its peers.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    basic::{Height, PeerID, Round, Step},
    bit_array::BitArray,
    block::BlockID,
    part_set::{Part, PartSetError, PartSetHeader, MAX_BLOCK_PARTS_COUNT},
    proposal::{Proposal, ProposalError},
    vote::{Vote, VoteError, VoteType},
    vote_set::MAX_VOTES_COUNT,
};

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum ConsensusMessage {
    NewRoundStep(NewRoundStepMessage),
    NewValidBlock(NewValidBlockMessage),
    Proposal(ProposalMessage),
    ProposalPOL(ProposalPOLMessage),
    BlockPart(BlockPartMessage),
    Vote(VoteMessage),
    HasVote(HasVoteMessage),
    VoteSetMaj23(VoteSetMaj23Message),
    VoteSetBits(VoteSetBitsMessage),
}

impl ConsensusMessage {
    pub fn validate_basic(&self) -> Result<(), MessageError> {
        match self {
            ConsensusMessage::NewRoundStep(msg) => msg.validate_basic(),
            ConsensusMessage::NewValidBlock(msg) => msg.validate_basic(),
            ConsensusMessage::Proposal(msg) => Ok(msg.proposal.validate_basic()?),
            ConsensusMessage::ProposalPOL(msg) => msg.validate_basic(),
            ConsensusMessage::BlockPart(msg) => Ok(msg.part.validate_basic()?),
            ConsensusMessage::Vote(msg) => Ok(msg.vote.validate_basic()?),
            ConsensusMessage::HasVote(msg) => msg.validate_basic(),
            ConsensusMessage::VoteSetMaj23(_) => Ok(()),
            ConsensusMessage::VoteSetBits(msg) => validate_bit_array(&msg.votes, MAX_VOTES_COUNT),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConsensusMessage::NewRoundStep(_) => "NewRoundStep",
            ConsensusMessage::NewValidBlock(_) => "NewValidBlock",
            ConsensusMessage::Proposal(_) => "Proposal",
            ConsensusMessage::ProposalPOL(_) => "ProposalPOL",
            ConsensusMessage::BlockPart(_) => "BlockPart",
            ConsensusMessage::Vote(_) => "Vote",
            ConsensusMessage::HasVote(_) => "HasVote",
            ConsensusMessage::VoteSetMaj23(_) => "VoteSetMaj23",
            ConsensusMessage::VoteSetBits(_) => "VoteSetBits",
        }
    }
}

/// Sent when a node enters a new step, so that peers know what to gossip to it.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct NewRoundStepMessage {
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub seconds_since_start_time: u64,
    pub last_commit_round: Option<Round>,
}

impl NewRoundStepMessage {
    fn validate_basic(&self) -> Result<(), MessageError> {
        if self.height == Height::new(1) && self.last_commit_round.is_some() {
            return Err(MessageError::UnexpectedLastCommitRound);
        }
        if self.height > Height::new(1) && self.last_commit_round.is_none() {
            return Err(MessageError::MissingLastCommitRound);
        }
        Ok(())
    }
}

/// Sent when a node sees a +2/3 prevote majority for a block, or the commit of a block, whose parts
/// it may not have yet.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct NewValidBlockMessage {
    pub height: Height,
    pub round: Round,
    pub block_parts_header: PartSetHeader,
    pub block_parts: BitArray,
    pub is_commit: bool,
}

impl NewValidBlockMessage {
    fn validate_basic(&self) -> Result<(), MessageError> {
        validate_bit_array(&self.block_parts, MAX_BLOCK_PARTS_COUNT as usize)?;
        if self.block_parts.size() != self.block_parts_header.total as usize {
            return Err(MessageError::BitArraySizeMismatch {
                expected: self.block_parts_header.total as usize,
                actual: self.block_parts.size(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct ProposalMessage {
    pub proposal: Proposal,
}

/// The prevotes a node has for the POL round of the current proposal.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct ProposalPOLMessage {
    pub height: Height,
    pub proposal_pol_round: Round,
    pub proposal_pol: BitArray,
}

impl ProposalPOLMessage {
    fn validate_basic(&self) -> Result<(), MessageError> {
        if self.proposal_pol.size() == 0 {
            return Err(MessageError::EmptyBitArray);
        }
        validate_bit_array(&self.proposal_pol, MAX_VOTES_COUNT)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct BlockPartMessage {
    pub height: Height,
    pub round: Round,
    pub part: Part,
}

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct VoteMessage {
    pub vote: Vote,
}

/// Sent to tell peers which vote a node has just added, so they do not gossip it back.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct HasVoteMessage {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub index: u32,
}

impl HasVoteMessage {
    fn validate_basic(&self) -> Result<(), MessageError> {
        if self.index as usize >= MAX_VOTES_COUNT {
            return Err(MessageError::IndexOutOfRange {
                index: self.index,
                max: MAX_VOTES_COUNT,
            });
        }
        Ok(())
    }
}

/// Claims that the sender has seen a +2/3 majority for `block_id`.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct VoteSetMaj23Message {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub block_id: Option<BlockID>,
}

/// The response to a [VoteSetMaj23Message]: which votes for `block_id` the sender has.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct VoteSetBitsMessage {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub block_id: Option<BlockID>,
    pub votes: BitArray,
}

// Bit arrays decoded from peers choose their size and their words independently.
fn validate_bit_array(bit_array: &BitArray, max_size: usize) -> Result<(), MessageError> {
    if !bit_array.is_well_formed() {
        return Err(MessageError::MalformedBitArray);
    }
    if bit_array.size() > max_size {
        return Err(MessageError::BitArrayTooLarge {
            size: bit_array.size(),
            max: max_size,
        });
    }
    Ok(())
}

/// A consensus message, together with the peer it came from. `peer` is `None` for messages generated
/// by this node.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct MsgInfo {
    pub msg: ConsensusMessage,
    pub peer: Option<PeerID>,
}

impl MsgInfo {
    pub fn internal(msg: ConsensusMessage) -> MsgInfo {
        MsgInfo { msg, peer: None }
    }

    pub fn from_peer(msg: ConsensusMessage, peer: PeerID) -> MsgInfo {
        MsgInfo {
            msg,
            peer: Some(peer),
        }
    }
}

/// A timeout scheduled for a given height, round, and step.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct TimeoutInfo {
    pub duration_ms: u64,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

/// Everything the consensus engine's receive loop reacts to.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ConsensusInput {
    Message(MsgInfo),
    Timeout(TimeoutInfo),
    /// The mempool has transactions for the next block.
    TxsAvailable,
}

#[derive(Debug)]
pub enum MessageError {
    InvalidProposal(ProposalError),
    InvalidPart(PartSetError),
    InvalidVote(VoteError),
    UnexpectedLastCommitRound,
    MissingLastCommitRound,
    BitArraySizeMismatch { expected: usize, actual: usize },
    BitArrayTooLarge { size: usize, max: usize },
    MalformedBitArray,
    EmptyBitArray,
    IndexOutOfRange { index: u32, max: usize },
}

impl From<ProposalError> for MessageError {
    fn from(value: ProposalError) -> Self {
        MessageError::InvalidProposal(value)
    }
}

impl From<PartSetError> for MessageError {
    fn from(value: PartSetError) -> Self {
        MessageError::InvalidPart(value)
    }
}

impl From<VoteError> for MessageError {
    fn from(value: VoteError) -> Self {
        MessageError::InvalidVote(value)
    }
}
