/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [ValidatorSet] and [ValidatorUpdate] types and their associated methods.
//!
//! ## Proposer selection
//!
//! The proposer of each round is chosen by weighted round-robin over proposer priorities. Every
//! [increment](ValidatorSet::increment_proposer_priority) adds each validator's voting power to its
//! priority, picks the validator with the highest priority (ties go to the smaller address) as the
//! proposer, and subtracts the total voting power from the proposer's priority. Over `total power`
//! increments, each validator is therefore proposer a number of times proportional to its power.
//!
//! Before incrementing, priorities are rescaled so that their spread stays within
//! `PRIORITY_WINDOW_SIZE_FACTOR * total power`, and shifted so that they are centered around 0. This
//! keeps a validator that joins, or has its power changed, from having to wait an unbounded number of
//! rounds before proposing.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Display, Formatter};

use super::{
    basic::{Address, ChainID, CryptoHash, Height, Power, TotalPower},
    block::{BlockID, Commit},
    crypto::PublicKeyBytes,
    merkle,
    vote::VoteType,
};

/// The maximum total voting power of a validator set. Keeps `priority + power` computations far from
/// overflowing an `i64`.
pub const MAX_TOTAL_VOTING_POWER: u64 = (i64::MAX / 8) as u64;

/// Priorities are rescaled when their spread exceeds this factor times the total voting power.
pub const PRIORITY_WINDOW_SIZE_FACTOR: i64 = 2;

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Validator {
    pub address: Address,
    pub pub_key: PublicKeyBytes,
    pub voting_power: Power,
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(pub_key: PublicKeyBytes, voting_power: Power) -> Validator {
        Validator {
            address: pub_key.address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Returns whichever of `self` and `other` should be proposer first.
    fn compare_proposer_priority<'a>(&'a self, other: &'a Validator) -> &'a Validator {
        if self.proposer_priority > other.proposer_priority {
            self
        } else if self.proposer_priority < other.proposer_priority {
            other
        } else if self.address <= other.address {
            self
        } else {
            other
        }
    }

    /// Bytes committed to by the validator set hash. Excludes the proposer priority, which changes every
    /// round.
    fn hash_bytes(&self) -> Vec<u8> {
        (self.pub_key, self.voting_power).try_to_vec().unwrap_or_default()
    }
}

/// A change to the validator set returned by the application at the end of a block. A power of 0
/// removes the validator.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct ValidatorUpdate {
    pub pub_key: PublicKeyBytes,
    pub power: Power,
}

impl ValidatorUpdate {
    pub fn new(pub_key: PublicKeyBytes, power: Power) -> ValidatorUpdate {
        ValidatorUpdate { pub_key, power }
    }
}

/// Identities of validators, their voting powers, and their proposer priorities.
///
/// Validators are kept in ascending order of their [addresses](Address). The index of a validator in
/// this order is its "validator index", which votes refer to.
///
/// # Limits to total power
///
/// The total power of a validator set must not exceed [MAX_TOTAL_VOTING_POWER].
#[derive(Clone, PartialEq, Eq, Debug, Default, BorshSerialize, BorshDeserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<Address>,
}

impl ValidatorSet {
    /// Create a validator set from `validators` and select its first proposer.
    pub fn new(validators: Vec<Validator>) -> Result<ValidatorSet, ValidatorSetError> {
        let mut validator_set = ValidatorSet::default();
        let changes: Vec<ValidatorUpdate> = validators
            .iter()
            .map(|validator| ValidatorUpdate::new(validator.pub_key, validator.voting_power))
            .collect();
        validator_set.update_with_change_set(&changes, false)?;
        if !validator_set.is_empty() {
            validator_set.increment_proposer_priority(1);
        }
        Ok(validator_set)
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Get the index and the validator with the given address.
    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.validators
            .binary_search_by(|validator| validator.address.cmp(address))
            .ok()
            .map(|index| (index, &self.validators[index]))
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    pub fn total_power(&self) -> TotalPower {
        let mut total_power = TotalPower::new(0);
        for validator in &self.validators {
            total_power += validator.voting_power
        }
        total_power
    }

    /// The minimum voting power strictly greater than two thirds of the total voting power.
    pub fn quorum(&self) -> u64 {
        ((self.total_power().int() as u128 * 2 / 3) + 1) as u64
    }

    /// Merkle root of the validators' public keys and voting powers, in index order.
    pub fn hash(&self) -> CryptoHash {
        let leaves: Vec<Vec<u8>> = self.validators.iter().map(Validator::hash_bytes).collect();
        merkle::hash_from_byte_slices(&leaves)
    }

    /// Get the proposer for the current round.
    pub fn get_proposer(&self) -> Option<&Validator> {
        if let Some(address) = &self.proposer {
            if let Some((_, proposer)) = self.get_by_address(address) {
                return Some(proposer);
            }
        }
        self.find_proposer()
    }

    fn find_proposer(&self) -> Option<&Validator> {
        let mut validators = self.validators.iter();
        let first = validators.next()?;
        Some(validators.fold(first, |proposer, validator| {
            proposer.compare_proposer_priority(validator)
        }))
    }

    /// Advance proposer selection by `times` rounds.
    pub fn increment_proposer_priority(&mut self, times: u32) {
        if self.is_empty() || times == 0 {
            return;
        }
        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR * self.total_power().int() as i64;
        self.rescale_priorities(diff_max);
        self.shift_by_avg_proposer_priority();

        let mut proposer = None;
        for _ in 0..times {
            proposer = self.increment_proposer_priority_once();
        }
        self.proposer = proposer;
    }

    /// Return a copy of this validator set advanced by `times` rounds.
    pub fn copy_increment_proposer_priority(&self, times: u32) -> ValidatorSet {
        let mut copy = self.clone();
        copy.increment_proposer_priority(times);
        copy
    }

    fn increment_proposer_priority_once(&mut self) -> Option<Address> {
        for validator in &mut self.validators {
            validator.proposer_priority = validator
                .proposer_priority
                .saturating_add(validator.voting_power.int() as i64);
        }
        let total_power = self.total_power().int() as i64;
        let address = self.find_proposer()?.address;
        if let Some(validator) = self
            .validators
            .iter_mut()
            .find(|validator| validator.address == address)
        {
            validator.proposer_priority = validator.proposer_priority.saturating_sub(total_power);
        }
        Some(address)
    }

    fn rescale_priorities(&mut self, diff_max: i64) {
        if diff_max <= 0 {
            return;
        }
        let max = self.validators.iter().map(|v| v.proposer_priority).max().unwrap_or(0);
        let min = self.validators.iter().map(|v| v.proposer_priority).min().unwrap_or(0);
        let diff = max.saturating_sub(min);
        if diff > diff_max {
            let ratio = (diff + diff_max - 1) / diff_max;
            for validator in &mut self.validators {
                validator.proposer_priority /= ratio;
            }
        }
    }

    fn shift_by_avg_proposer_priority(&mut self) {
        if self.is_empty() {
            return;
        }
        let sum: i128 = self
            .validators
            .iter()
            .map(|validator| validator.proposer_priority as i128)
            .sum();
        let avg = sum.div_euclid(self.validators.len() as i128) as i64;
        for validator in &mut self.validators {
            validator.proposer_priority = validator.proposer_priority.saturating_sub(avg);
        }
    }

    /// Apply the validator updates in `changes`. An update with power 0 removes a validator, any other
    /// update inserts or modifies one. New validators start with a priority low enough that they do not
    /// immediately become proposer.
    ///
    /// Either all of `changes` are applied, or (on error) none of them are.
    pub fn update_with_change_set(
        &mut self,
        changes: &[ValidatorUpdate],
        allow_deletes: bool,
    ) -> Result<(), ValidatorSetError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut sorted: Vec<Validator> = changes
            .iter()
            .map(|change| Validator::new(change.pub_key, change.power))
            .collect();
        sorted.sort_by(|a, b| a.address.cmp(&b.address));
        for pair in sorted.windows(2) {
            if pair[0].address == pair[1].address {
                return Err(ValidatorSetError::DuplicateValidator {
                    address: pair[0].address,
                });
            }
        }
        for validator in &sorted {
            if validator.voting_power.int() > MAX_TOTAL_VOTING_POWER {
                return Err(ValidatorSetError::VotingPowerTooHigh {
                    address: validator.address,
                    power: validator.voting_power,
                });
            }
        }

        let (updates, deletes): (Vec<Validator>, Vec<Validator>) = sorted
            .into_iter()
            .partition(|validator| validator.voting_power.int() > 0);
        if !allow_deletes && !deletes.is_empty() {
            return Err(ValidatorSetError::DeletesNotAllowed);
        }
        for deleted in &deletes {
            if !self.has_address(&deleted.address) {
                return Err(ValidatorSetError::RemovalOfMissingValidator {
                    address: deleted.address,
                });
            }
        }

        // Total power after updates but before removals must fit the limit.
        let mut total_after_updates = self.total_power().int() as u128;
        for update in &updates {
            if let Some((_, existing)) = self.get_by_address(&update.address) {
                total_after_updates -= existing.voting_power.int() as u128;
            }
            total_after_updates += update.voting_power.int() as u128;
        }
        if total_after_updates > MAX_TOTAL_VOTING_POWER as u128 {
            return Err(ValidatorSetError::TotalPowerTooHigh {
                total: total_after_updates,
            });
        }
        let total_after_updates = total_after_updates as i64;

        let mut next = self.validators.clone();
        for mut update in updates {
            match next.binary_search_by(|validator| validator.address.cmp(&update.address)) {
                Ok(index) => {
                    update.proposer_priority = next[index].proposer_priority;
                    next[index] = update;
                }
                Err(index) => {
                    update.proposer_priority = -(total_after_updates + (total_after_updates >> 3));
                    next.insert(index, update);
                }
            }
        }
        next.retain(|validator| {
            deletes
                .binary_search_by(|deleted| deleted.address.cmp(&validator.address))
                .is_err()
        });
        if next.is_empty() {
            return Err(ValidatorSetError::EmptyValidatorSet);
        }

        self.validators = next;
        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR * self.total_power().int() as i64;
        self.rescale_priorities(diff_max);
        self.shift_by_avg_proposer_priority();
        Ok(())
    }

    /// Check that `commit` contains valid precommits for `block_id` at `height` from more than two thirds
    /// of the voting power of this validator set.
    pub fn verify_commit(
        &self,
        chain_id: &ChainID,
        block_id: &BlockID,
        height: Height,
        commit: &Commit,
    ) -> Result<(), CommitVerificationError> {
        if self.len() != commit.precommits.len() {
            return Err(CommitVerificationError::WrongSetSize {
                expected: self.len(),
                actual: commit.precommits.len(),
            });
        }
        let commit_height = commit.height().ok_or(CommitVerificationError::EmptyCommit)?;
        if commit_height != height {
            return Err(CommitVerificationError::WrongHeight {
                expected: height,
                actual: commit_height,
            });
        }
        if commit.block_id != *block_id {
            return Err(CommitVerificationError::WrongBlockID);
        }

        let round = commit.round().ok_or(CommitVerificationError::EmptyCommit)?;
        let mut tallied: u64 = 0;
        for (index, precommit) in commit.precommits.iter().enumerate() {
            let precommit = match precommit {
                Some(precommit) => precommit,
                None => continue,
            };
            if precommit.height != height
                || precommit.round != round
                || precommit.vote_type != VoteType::Precommit
            {
                return Err(CommitVerificationError::InvalidPrecommit { index });
            }
            let validator = self
                .get_by_index(index)
                .ok_or(CommitVerificationError::InvalidPrecommit { index })?;
            if !validator
                .pub_key
                .verify(&precommit.sign_bytes(chain_id), &precommit.signature)
            {
                return Err(CommitVerificationError::InvalidSignature { index });
            }
            if precommit.block_id.as_ref() == Some(block_id) {
                tallied += validator.voting_power.int();
            }
        }

        if tallied >= self.quorum() {
            Ok(())
        } else {
            Err(CommitVerificationError::InsufficientVotingPower {
                tallied,
                needed: self.quorum(),
            })
        }
    }
}

impl Display for ValidatorSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorSet{{")?;
        for validator in &self.validators {
            write!(
                f,
                "{}:{}:{} ",
                validator.address,
                validator.voting_power.int(),
                validator.proposer_priority
            )?;
        }
        write!(f, "}}")
    }
}

/// Enumerates the ways that applying a set of validator updates can fail.
#[derive(Debug)]
pub enum ValidatorSetError {
    DuplicateValidator { address: Address },
    VotingPowerTooHigh { address: Address, power: Power },
    TotalPowerTooHigh { total: u128 },
    RemovalOfMissingValidator { address: Address },
    DeletesNotAllowed,
    EmptyValidatorSet,
}

/// Enumerates the ways that a commit can fail verification against a validator set.
#[derive(Debug)]
pub enum CommitVerificationError {
    EmptyCommit,
    WrongSetSize { expected: usize, actual: usize },
    WrongHeight { expected: Height, actual: Height },
    WrongBlockID,
    InvalidPrecommit { index: usize },
    InvalidSignature { index: usize },
    InsufficientVotingPower { tallied: u64, needed: u64 },
}
