/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The prevotes and precommits of every round of the current height.
//!
//! Rounds up to the engine's current round (plus one, see [set_round](HeightVoteSet::set_round)) are
//! always tracked. Votes for later rounds are accepted only from a bounded number of rounds per peer,
//! so that a faulty peer cannot make the node allocate vote sets for arbitrarily many rounds.

use std::collections::{BTreeMap, HashMap};

use crate::types::{
    basic::{ChainID, Height, PeerID, Round},
    block::BlockID,
    validators::ValidatorSet,
    vote::{Vote, VoteType},
    vote_set::{VoteSet, VoteSetError},
};

/// How many untracked rounds a single peer may introduce votes for.
pub const MAX_CATCHUP_ROUNDS_PER_PEER: usize = 2;

struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

pub struct HeightVoteSet {
    chain_id: ChainID,
    height: Height,
    validators: ValidatorSet,
    round: Round,
    round_vote_sets: BTreeMap<Round, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerID, Vec<Round>>,
}

impl HeightVoteSet {
    pub fn new(chain_id: ChainID, height: Height, validators: ValidatorSet) -> HeightVoteSet {
        let mut height_vote_set = HeightVoteSet {
            chain_id,
            height,
            validators,
            round: Round::new(0),
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        height_vote_set.add_round(Round::new(0));
        height_vote_set
    }

    pub fn height(&self) -> Height {
        self.height
    }

    /// The highest round tracked unconditionally.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Track every round up to and including `round`.
    ///
    /// Rounds are never untracked, but `round` may not go below the current round minus one.
    pub fn set_round(&mut self, round: Round) -> Result<(), VoteSetError> {
        let lowest = Round::new(self.round.int().saturating_sub(1));
        if self.round != Round::new(0) && round < lowest {
            return Err(VoteSetError::NonIncreasingRound {
                current: self.round,
                requested: round,
            });
        }
        for r in lowest.int()..=round.int() {
            let r = Round::new(r);
            if !self.round_vote_sets.contains_key(&r) {
                self.add_round(r);
            }
        }
        self.round = round;
        Ok(())
    }

    /// Add `vote` to the vote set of its round and type. `peer` is the peer the vote came from, `None`
    /// if it is this node's own vote.
    ///
    /// Votes for an untracked round start tracking that round, as long as the peer has not already
    /// used up its [MAX_CATCHUP_ROUNDS_PER_PEER]. Own and replayed votes (`peer` is `None`) are never
    /// limited.
    pub fn add_vote(&mut self, vote: Vote, peer: Option<&PeerID>) -> Result<bool, VoteSetError> {
        if !self.round_vote_sets.contains_key(&vote.round) {
            if let Some(peer) = peer {
                let catchup_rounds = self
                    .peer_catchup_rounds
                    .entry(peer.clone())
                    .or_insert_with(Vec::new);
                if catchup_rounds.len() >= MAX_CATCHUP_ROUNDS_PER_PEER {
                    return Err(VoteSetError::GotVoteFromUnwantedRound {
                        peer: Some(peer.clone()),
                        round: vote.round,
                    });
                }
                catchup_rounds.push(vote.round);
            }
            self.add_round(vote.round);
        }

        match self.vote_set_mut(vote.round, vote.vote_type) {
            Some(vote_set) => vote_set.add_vote(vote),
            None => Ok(false),
        }
    }

    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Prevote)
    }

    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Precommit)
    }

    pub fn vote_set(&self, round: Round, vote_type: VoteType) -> Option<&VoteSet> {
        self.round_vote_sets
            .get(&round)
            .map(|round_vote_set| match vote_type {
                VoteType::Prevote => &round_vote_set.prevotes,
                VoteType::Precommit => &round_vote_set.precommits,
            })
    }

    /// The last round with a +2/3 prevote majority for a block, together with that block.
    pub fn pol_info(&self) -> Option<(Round, BlockID)> {
        self.round_vote_sets
            .iter()
            .rev()
            .filter(|(round, _)| **round <= self.round)
            .find_map(|(round, round_vote_set)| match round_vote_set.prevotes.two_thirds_majority() {
                Some(Some(block_id)) => Some((*round, block_id)),
                _ => None,
            })
    }

    /// Record that `peer` claims a +2/3 majority for `block_id` in the given vote set. Claims for
    /// untracked rounds are ignored.
    pub fn set_peer_maj23(
        &mut self,
        round: Round,
        vote_type: VoteType,
        peer: PeerID,
        block_id: Option<BlockID>,
    ) -> Result<(), VoteSetError> {
        match self.vote_set_mut(round, vote_type) {
            Some(vote_set) => vote_set.set_peer_maj23(peer, block_id),
            None => Ok(()),
        }
    }

    fn vote_set_mut(&mut self, round: Round, vote_type: VoteType) -> Option<&mut VoteSet> {
        self.round_vote_sets
            .get_mut(&round)
            .map(|round_vote_set| match vote_type {
                VoteType::Prevote => &mut round_vote_set.prevotes,
                VoteType::Precommit => &mut round_vote_set.precommits,
            })
    }

    fn add_round(&mut self, round: Round) {
        log::trace!("Adding round {} to height {} vote set", round, self.height);
        let prevotes = VoteSet::new(
            self.chain_id.clone(),
            self.height,
            round,
            VoteType::Prevote,
            self.validators.clone(),
        );
        let precommits = VoteSet::new(
            self.chain_id.clone(),
            self.height,
            round,
            VoteType::Precommit,
            self.validators.clone(),
        );
        self.round_vote_sets.insert(
            round,
            RoundVoteSet {
                prevotes,
                precommits,
            },
        );
    }
}
