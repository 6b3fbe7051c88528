/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [State] type: everything needed to validate and propose the next block.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    basic::{Address, AppHash, ChainID, CryptoHash, Height, Timestamp, Tx},
    block::{Block, BlockID, Commit, Header},
    genesis::{GenesisDoc, GenesisError},
    params::ConsensusParams,
    part_set::{PartSet, BLOCK_PART_SIZE_BYTES},
    validators::ValidatorSet,
};

/// The state after executing the block at `last_block_height`.
///
/// The validators that decide block `h` are `validators`. `next_validators` (which the application may
/// change in `end_block`) decide block `h + 1`, and `last_validators` signed the commit included in
/// block `h`.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct State {
    pub chain_id: ChainID,

    /// 0 at genesis.
    pub last_block_height: Height,
    pub last_block_total_tx: u64,
    pub last_block_id: Option<BlockID>,
    /// The genesis time at genesis.
    pub last_block_time: Timestamp,

    pub next_validators: ValidatorSet,
    pub validators: ValidatorSet,
    pub last_validators: ValidatorSet,
    pub last_height_validators_changed: Height,

    pub consensus_params: ConsensusParams,
    pub last_height_consensus_params_changed: Height,

    /// Merkle root of the transaction results of the last block.
    pub last_results_hash: CryptoHash,

    /// The application's hash after executing the last block.
    pub app_hash: AppHash,
}

impl State {
    pub fn from_genesis(genesis: &GenesisDoc) -> Result<State, GenesisError> {
        genesis.validate()?;
        let validators = genesis.validator_set()?;
        let next_validators = validators.copy_increment_proposer_priority(1);

        Ok(State {
            chain_id: genesis.chain_id.clone(),
            last_block_height: Height::new(0),
            last_block_total_tx: 0,
            last_block_id: None,
            last_block_time: genesis.genesis_time,
            next_validators,
            validators,
            last_validators: ValidatorSet::default(),
            last_height_validators_changed: Height::new(1),
            consensus_params: genesis.consensus_params,
            last_height_consensus_params_changed: Height::new(1),
            last_results_hash: CryptoHash::default(),
            app_hash: genesis.app_hash.clone(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Build the block at `height` with the given transactions, the commit for the previous block, and the
    /// header fields determined by this state. The block time is the genesis time for the first block, and
    /// the weighted median of the commit's precommit times after that.
    pub fn make_block(
        &self,
        height: Height,
        txs: Vec<Tx>,
        last_commit: Commit,
        proposer_address: Address,
    ) -> (Block, PartSet) {
        let time = if height == Height::new(1) {
            self.last_block_time
        } else {
            median_time(&last_commit, &self.last_validators)
        };

        let header = Header {
            chain_id: self.chain_id.clone(),
            height,
            time,
            num_txs: txs.len() as u64,
            total_txs: self.last_block_total_tx + txs.len() as u64,
            last_block_id: self.last_block_id,
            last_commit_hash: last_commit.hash(),
            data_hash: Block::txs_hash(&txs),
            validators_hash: self.validators.hash(),
            next_validators_hash: self.next_validators.hash(),
            consensus_hash: self.consensus_params.hash(),
            app_hash: self.app_hash.clone(),
            last_results_hash: self.last_results_hash,
            proposer_address,
        };
        let block = Block {
            header,
            txs,
            last_commit,
        };
        let parts = block.make_part_set(BLOCK_PART_SIZE_BYTES);
        (block, parts)
    }
}

/// The validator set that decides the block at a height, and the last height at which it changed.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct ValidatorsInfo {
    pub last_height_changed: Height,
    pub validator_set: ValidatorSet,
}

/// The voting-power-weighted median of the timestamps of the precommits in `commit`.
///
/// As long as more than two thirds of the voting power is honest, the result lies between the
/// timestamps of two honest validators' precommits.
pub fn median_time(commit: &Commit, validators: &ValidatorSet) -> Timestamp {
    let mut weighted_times: Vec<(Timestamp, u64)> = Vec::with_capacity(commit.size());
    let mut total_power: u64 = 0;
    for precommit in commit.precommits.iter().flatten() {
        if let Some((_, validator)) = validators.get_by_address(&precommit.validator_address) {
            total_power += validator.voting_power.int();
            weighted_times.push((precommit.timestamp, validator.voting_power.int()));
        }
    }

    weighted_times.sort_by_key(|(time, _)| *time);
    let mut median = total_power / 2;
    for (time, weight) in &weighted_times {
        if median <= *weight {
            return *time;
        }
        median -= weight;
    }
    Timestamp::default()
}
