/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [VoteSet] type, which accumulates the votes of one type for one `(height, round)` and detects
//! when some block (or nil) has been voted for by more than two thirds of the total voting power.
//!
//! ## Conflicting votes
//!
//! A validator that signs two different votes for the same `(height, round, type)` is Byzantine. The
//! first vote seen from a validator is its "primary" vote, and is the only one that counts towards
//! [VoteSet::has_two_thirds_any]. A conflicting vote is reported to the caller as
//! [VoteSetError::ConflictingVotes], and is tallied under its block only if some peer has claimed (via
//! [VoteSet::set_peer_maj23]) that the block has a +2/3 majority. This bounds the memory a Byzantine
//! validator can make us spend, while still letting us reach a majority that other validators have seen.
//!
//! ## Majorities
//!
//! At most one block (or nil) can reach a +2/3 majority in a vote set unless more than one third of the
//! voting power is Byzantine. The first majority is kept. A second majority is recorded and reported as
//! [VoteSetError::ConflictingMajorities].

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use super::{
    basic::{Address, ChainID, Height, PeerID, Round},
    bit_array::BitArray,
    block::{BlockID, Commit},
    validators::ValidatorSet,
    vote::{Vote, VoteError, VoteType},
};

/// Upper bound on the number of votes in a vote set, and so on the size of a validator set.
pub const MAX_VOTES_COUNT: usize = 10000;

#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: ChainID,
    height: Height,
    round: Round,
    vote_type: VoteType,
    validators: ValidatorSet,

    votes_bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: u64,
    maj23: Option<Option<BlockID>>,
    conflicting_maj23: Option<Option<BlockID>>,
    votes_by_block: HashMap<Option<BlockID>, BlockVotes>,
    peer_maj23s: HashMap<PeerID, Option<BlockID>>,
}

/// The votes for a single block (or nil).
#[derive(Clone, Debug)]
struct BlockVotes {
    peer_maj23: bool,
    bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: u64,
}

impl BlockVotes {
    fn new(peer_maj23: bool, num_validators: usize) -> BlockVotes {
        BlockVotes {
            peer_maj23,
            bit_array: BitArray::new(num_validators),
            votes: vec![None; num_validators],
            sum: 0,
        }
    }

    fn add_verified_vote(&mut self, vote: Vote, voting_power: u64) {
        let index = vote.validator_index as usize;
        if self.votes[index].is_none() {
            self.bit_array.set_index(index, true);
            self.votes[index] = Some(vote);
            self.sum += voting_power;
        }
    }

    fn get_by_index(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(|vote| vote.as_ref())
    }
}

impl VoteSet {
    pub fn new(
        chain_id: ChainID,
        height: Height,
        round: Round,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> VoteSet {
        let size = validators.len();
        VoteSet {
            chain_id,
            height,
            round,
            vote_type,
            validators,
            votes_bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
            maj23: None,
            conflicting_maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    /// Rebuild the precommit vote set that `commit` was made from.
    pub fn from_commit(
        chain_id: ChainID,
        commit: &Commit,
        validators: ValidatorSet,
    ) -> Result<VoteSet, VoteSetError> {
        let height = commit.height().ok_or(VoteSetError::EmptyCommit)?;
        let round = commit.round().ok_or(VoteSetError::EmptyCommit)?;
        let mut vote_set = VoteSet::new(chain_id, height, round, VoteType::Precommit, validators);
        for precommit in commit.precommits.iter().flatten() {
            vote_set.add_vote(precommit.clone())?;
        }
        Ok(vote_set)
    }

    pub fn chain_id(&self) -> &ChainID {
        &self.chain_id
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Add `vote` to the set.
    ///
    /// Returns `Ok(true)` if the vote was added, and `Ok(false)` if exactly the same vote was already in
    /// the set. The vote may have been added even if this returns [VoteSetError::ConflictingVotes], which
    /// carries an `added` flag. [VoteSetError::ConflictingMajorities] means the vote was added, and
    /// carries the conflicting votes if the vote was also a double sign.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        if vote.height != self.height || vote.round != self.round || vote.vote_type != self.vote_type
        {
            return Err(VoteSetError::UnexpectedStep {
                expected: (self.height, self.round, self.vote_type),
                got: (vote.height, vote.round, vote.vote_type),
            });
        }

        let index = vote.validator_index as usize;
        let (voting_power, pub_key) = match self.validators.get_by_index(index) {
            Some(validator) => {
                if validator.address != vote.validator_address {
                    return Err(VoteSetError::InvalidValidatorAddress {
                        index: vote.validator_index,
                        address: vote.validator_address,
                    });
                }
                (validator.voting_power.int(), validator.pub_key)
            }
            None => {
                return Err(VoteSetError::InvalidValidatorIndex {
                    index: vote.validator_index,
                })
            }
        };

        if let Some(existing) = self.get_vote(index, &vote.block_id) {
            if existing.signature == vote.signature {
                return Ok(false);
            }
            return Err(VoteSetError::NonDeterministicSignature {
                index: vote.validator_index,
            });
        }

        vote.validate_basic()?;
        vote.verify(&self.chain_id, &pub_key)?;

        self.add_verified_vote(vote, voting_power)
    }

    fn get_vote(&self, index: usize, block_id: &Option<BlockID>) -> Option<&Vote> {
        if let Some(Some(existing)) = self.votes.get(index) {
            if existing.block_id == *block_id {
                return Some(existing);
            }
        }
        self.votes_by_block
            .get(block_id)
            .and_then(|block_votes| block_votes.get_by_index(index))
    }

    fn add_verified_vote(&mut self, vote: Vote, voting_power: u64) -> Result<bool, VoteSetError> {
        let index = vote.validator_index as usize;
        let block_id = vote.block_id;

        let conflicting = match &self.votes[index] {
            Some(existing) => {
                let existing = existing.clone();
                // A conflicting vote replaces the primary vote only if it is for the majority block.
                if self.maj23 == Some(block_id) {
                    self.votes[index] = Some(vote.clone());
                    self.votes_bit_array.set_index(index, true);
                }
                Some(existing)
            }
            None => {
                self.votes[index] = Some(vote.clone());
                self.votes_bit_array.set_index(index, true);
                self.sum += voting_power;
                None
            }
        };

        // A conflicting vote is only tallied under a block that some peer claims has a majority.
        let claimed_by_peer = self
            .votes_by_block
            .get(&block_id)
            .map(|block_votes| block_votes.peer_maj23)
            .unwrap_or(false);
        if let Some(existing) = &conflicting {
            if !claimed_by_peer {
                return Err(VoteSetError::ConflictingVotes {
                    existing: existing.clone(),
                    conflicting: vote,
                    added: false,
                });
            }
        }

        let num_validators = self.validators.len();
        let block_votes = self
            .votes_by_block
            .entry(block_id)
            .or_insert_with(|| BlockVotes::new(false, num_validators));

        let quorum = self.validators.quorum();
        let orig_sum = block_votes.sum;
        block_votes.add_verified_vote(vote.clone(), voting_power);
        let crossed_quorum = orig_sum < quorum && quorum <= block_votes.sum;

        let evidence = conflicting.map(|existing| (existing, vote));

        if crossed_quorum {
            match self.maj23 {
                None => {
                    self.maj23 = Some(block_id);
                    for (index, block_vote) in block_votes.votes.iter().enumerate() {
                        if let Some(block_vote) = block_vote {
                            self.votes[index] = Some(block_vote.clone());
                        }
                    }
                }
                Some(first) if first != block_id => {
                    self.conflicting_maj23 = Some(block_id);
                    return Err(VoteSetError::ConflictingMajorities {
                        first,
                        second: block_id,
                        evidence,
                    });
                }
                Some(_) => (),
            }
        }

        match evidence {
            Some((existing, conflicting)) => Err(VoteSetError::ConflictingVotes {
                existing,
                conflicting,
                added: true,
            }),
            None => Ok(true),
        }
    }

    /// Record that `peer` claims to have seen a +2/3 majority for `block_id`. Votes for `block_id` that
    /// conflict with a validator's primary vote are tallied from now on.
    pub fn set_peer_maj23(
        &mut self,
        peer: PeerID,
        block_id: Option<BlockID>,
    ) -> Result<(), VoteSetError> {
        if let Some(existing) = self.peer_maj23s.get(&peer) {
            if *existing == block_id {
                return Ok(());
            }
            return Err(VoteSetError::ConflictingPeerMaj23 { peer });
        }
        self.peer_maj23s.insert(peer, block_id);

        let num_validators = self.validators.len();
        self.votes_by_block
            .entry(block_id)
            .and_modify(|block_votes| block_votes.peer_maj23 = true)
            .or_insert_with(|| BlockVotes::new(true, num_validators));
        Ok(())
    }

    /// Which validators have a vote in this set.
    pub fn bit_array(&self) -> BitArray {
        self.votes_bit_array.clone()
    }

    /// Which validators have voted for `block_id`, if any vote for it is being tracked.
    pub fn bit_array_by_block_id(&self, block_id: &Option<BlockID>) -> Option<BitArray> {
        self.votes_by_block
            .get(block_id)
            .map(|block_votes| block_votes.bit_array.clone())
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(|vote| vote.as_ref())
    }

    pub fn get_by_address(&self, address: &Address) -> Option<&Vote> {
        let (index, _) = self.validators.get_by_address(address)?;
        self.get_by_index(index)
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Returns true if this is a precommit set with a +2/3 majority for anything, including nil.
    pub fn is_commit(&self) -> bool {
        self.vote_type == VoteType::Precommit && self.maj23.is_some()
    }

    /// Returns true if more than two thirds of the voting power has voted, for anything.
    pub fn has_two_thirds_any(&self) -> bool {
        self.sum >= self.validators.quorum()
    }

    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_power().int()
    }

    /// `Some(block_id)` if `block_id` (`None` for nil) has a +2/3 majority.
    pub fn two_thirds_majority(&self) -> Option<Option<BlockID>> {
        self.maj23
    }

    /// A second majority seen after [two_thirds_majority](Self::two_thirds_majority), if any.
    pub fn conflicting_majority(&self) -> Option<Option<BlockID>> {
        self.conflicting_maj23
    }

    /// Make the commit for the block that this precommit set has a +2/3 majority for.
    pub fn make_commit(&self) -> Result<Commit, VoteSetError> {
        if self.vote_type != VoteType::Precommit {
            return Err(VoteSetError::NotAPrecommitSet);
        }
        match self.maj23 {
            Some(Some(block_id)) => Ok(Commit {
                block_id,
                precommits: self.votes.clone(),
            }),
            _ => Err(VoteSetError::NoBlockMajority),
        }
    }
}

impl Display for VoteSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let maj23 = match self.maj23 {
            Some(Some(block_id)) => block_id.hash.to_string(),
            Some(None) => String::from("nil"),
            None => String::from("-"),
        };
        write!(
            f,
            "VoteSet{{H:{} R:{} T:{} +2/3:{} {} {}/{}}}",
            self.height,
            self.round,
            self.vote_type,
            maj23,
            self.votes_bit_array,
            self.sum,
            self.validators.total_power().int()
        )
    }
}

#[derive(Debug)]
pub enum VoteSetError {
    UnexpectedStep {
        expected: (Height, Round, VoteType),
        got: (Height, Round, VoteType),
    },
    InvalidValidatorIndex {
        index: u32,
    },
    InvalidValidatorAddress {
        index: u32,
        address: Address,
    },
    InvalidVote(VoteError),
    /// The validator already has a vote for the same block with a different signature.
    NonDeterministicSignature {
        index: u32,
    },
    ConflictingVotes {
        existing: Vote,
        conflicting: Vote,
        added: bool,
    },
    /// `evidence` holds the existing and the conflicting vote if the vote that completed the second
    /// majority conflicts with its validator's primary vote.
    ConflictingMajorities {
        first: Option<BlockID>,
        second: Option<BlockID>,
        evidence: Option<(Vote, Vote)>,
    },
    ConflictingPeerMaj23 {
        peer: PeerID,
    },
    GotVoteFromUnwantedRound {
        peer: Option<PeerID>,
        round: Round,
    },
    NonIncreasingRound {
        current: Round,
        requested: Round,
    },
    NotAPrecommitSet,
    NoBlockMajority,
    EmptyCommit,
}

impl From<VoteError> for VoteSetError {
    fn from(value: VoteError) -> Self {
        VoteSetError::InvalidVote(value)
    }
}
