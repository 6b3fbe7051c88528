/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [BlockExecutor], which creates proposal blocks, validates blocks against the [State], and applies
//! committed blocks to the application.
//!
//! ## Applying a block
//!
//! [apply_block](BlockExecutor::apply_block) does the following, in order:
//! 1. Validate the block against the current state.
//! 2. Execute the block against the application (`begin_block`, `deliver_tx` for every transaction,
//!    `end_block`), and save the results.
//! 3. Compute the next state from the results, including validator set and consensus param updates.
//! 4. With the mempool locked, `commit` the application and remove the block's transactions from the
//!    mempool.
//! 5. Save the next state, with the application's new app hash.
//! 6. Publish [NewBlock](crate::events::NewBlockEvent), [NewBlockHeader](crate::events::NewBlockHeaderEvent),
//!    and (if there are any) [ValidatorSetUpdates](crate::events::ValidatorSetUpdatesEvent).
//!
//! Because the results are saved before the application commits, a crash between steps 4 and 5 can be
//! recovered from by replaying the saved results against a mock application during the
//! [handshake](crate::consensus::replay::Handshaker).

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::app::{
    ABCIResponses, AppConn, AppConnError, BeginBlockRequest, EndBlockRequest, LastCommitInfo,
    VoteInfo,
};
use crate::events::{Event, NewBlockEvent, NewBlockHeaderEvent, ValidatorSetUpdatesEvent};
use crate::kv_store::KVStore;
use crate::mempool::{Mempool, MempoolError};
use crate::types::{
    basic::{Address, AppHash, Height},
    block::{Block, BlockError, BlockID, Commit},
    params::ConsensusParamsError,
    part_set::PartSet,
    validators::{CommitVerificationError, ValidatorSet, ValidatorSetError},
};

use super::state::{median_time, State};
use super::store::{StateStore, StateStoreError};

pub struct BlockExecutor<K: KVStore> {
    state_store: StateStore<K>,
    app: Box<dyn AppConn>,
    mempool: Box<dyn Mempool>,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore> BlockExecutor<K> {
    pub fn new(
        state_store: StateStore<K>,
        app: Box<dyn AppConn>,
        mempool: Box<dyn Mempool>,
        event_publisher: Option<Sender<Event>>,
    ) -> BlockExecutor<K> {
        BlockExecutor {
            state_store,
            app,
            mempool,
            event_publisher,
        }
    }

    pub fn state_store(&self) -> &StateStore<K> {
        &self.state_store
    }

    pub fn mempool(&mut self) -> &mut dyn Mempool {
        self.mempool.as_mut()
    }

    /// Give back the application connection, e.g. once a replayed block has been applied.
    pub fn into_app(self) -> Box<dyn AppConn> {
        self.app
    }

    /// Build a block at `height` from the transactions at the head of the mempool, as large as the
    /// consensus params allow.
    pub fn create_proposal_block(
        &self,
        height: Height,
        state: &State,
        last_commit: Commit,
        proposer_address: Address,
    ) -> (Block, PartSet) {
        let block_params = state.consensus_params.block;
        let txs = self
            .mempool
            .reap_max_bytes_max_gas(block_params.max_data_bytes, block_params.max_gas);
        state.make_block(height, txs, last_commit, proposer_address)
    }

    /// Check that `block` can be the block following `state`.
    pub fn validate_block(&self, state: &State, block: &Block) -> Result<(), InvalidBlockError> {
        validate_block(state, block)
    }

    /// Validate, execute, and commit `block`, and return the state after it. See the
    /// [module-level docs](self) for the order of effects.
    pub fn apply_block(
        &mut self,
        state: &State,
        block_id: BlockID,
        block: &Block,
    ) -> Result<State, BlockExecutionError> {
        validate_block(state, block)?;

        let abci_responses = exec_block_on_app(self.app.as_mut(), block, &state.last_validators)?;
        self.state_store
            .save_abci_responses(block.height(), &abci_responses)?;

        let mut next_state = update_state(state, block_id, block, &abci_responses)?;

        let app_hash = self.commit(block, &abci_responses)?;

        next_state.app_hash = app_hash;
        self.state_store.save_state(&next_state)?;

        self.fire_events(block, &abci_responses);
        Ok(next_state)
    }

    fn commit(
        &mut self,
        block: &Block,
        abci_responses: &ABCIResponses,
    ) -> Result<AppHash, BlockExecutionError> {
        self.mempool.lock();
        let result = self.commit_locked(block, abci_responses);
        self.mempool.unlock();
        result
    }

    fn commit_locked(
        &mut self,
        block: &Block,
        abci_responses: &ABCIResponses,
    ) -> Result<AppHash, BlockExecutionError> {
        let response = self.app.commit()?;
        log::info!(
            "Committed state. height: {}, txs: {}, app_hash: {}",
            block.height(),
            block.header.num_txs,
            response.data
        );
        self.mempool
            .update(block.height(), &block.txs, &abci_responses.deliver_txs)?;
        Ok(response.data)
    }

    fn fire_events(&self, block: &Block, abci_responses: &ABCIResponses) {
        Event::publish(
            &self.event_publisher,
            Event::NewBlock(NewBlockEvent {
                timestamp: SystemTime::now(),
                block: block.clone(),
            }),
        );
        Event::publish(
            &self.event_publisher,
            Event::NewBlockHeader(NewBlockHeaderEvent {
                timestamp: SystemTime::now(),
                header: block.header.clone(),
            }),
        );
        let validator_updates = &abci_responses.end_block.validator_updates;
        if !validator_updates.is_empty() {
            Event::publish(
                &self.event_publisher,
                Event::ValidatorSetUpdates(ValidatorSetUpdatesEvent {
                    timestamp: SystemTime::now(),
                    height: block.height(),
                    validator_updates: validator_updates.clone(),
                }),
            );
        }
    }
}

/// Check that `block` can be the block following `state`.
pub fn validate_block(state: &State, block: &Block) -> Result<(), InvalidBlockError> {
    block.validate_basic()?;

    let header = &block.header;
    if header.chain_id != state.chain_id {
        return Err(InvalidBlockError::WrongChainID);
    }
    if header.height != state.last_block_height.next() {
        return Err(InvalidBlockError::WrongHeight {
            expected: state.last_block_height.next(),
            actual: header.height,
        });
    }
    if header.last_block_id != state.last_block_id {
        return Err(InvalidBlockError::WrongLastBlockID);
    }
    if header.app_hash != state.app_hash {
        return Err(InvalidBlockError::WrongAppHash {
            expected: state.app_hash.clone(),
            actual: header.app_hash.clone(),
        });
    }
    if header.consensus_hash != state.consensus_params.hash() {
        return Err(InvalidBlockError::WrongConsensusHash);
    }
    if header.last_results_hash != state.last_results_hash {
        return Err(InvalidBlockError::WrongLastResultsHash);
    }
    if header.validators_hash != state.validators.hash() {
        return Err(InvalidBlockError::WrongValidatorsHash);
    }
    if header.next_validators_hash != state.next_validators.hash() {
        return Err(InvalidBlockError::WrongNextValidatorsHash);
    }
    if header.total_txs != state.last_block_total_tx + header.num_txs {
        return Err(InvalidBlockError::WrongTotalTxs);
    }

    if header.height == Height::new(1) {
        if !block.last_commit.precommits.is_empty() {
            return Err(InvalidBlockError::NonEmptyFirstLastCommit);
        }
        if header.time != state.last_block_time {
            return Err(InvalidBlockError::WrongTime {
                expected: state.last_block_time.millis(),
                actual: header.time.millis(),
            });
        }
    } else {
        let last_block_id = state
            .last_block_id
            .ok_or(InvalidBlockError::WrongLastBlockID)?;
        state.last_validators.verify_commit(
            &state.chain_id,
            &last_block_id,
            state.last_block_height,
            &block.last_commit,
        )?;
        if header.time <= state.last_block_time {
            return Err(InvalidBlockError::NonMonotonicTime);
        }
        let expected = median_time(&block.last_commit, &state.last_validators);
        if header.time != expected {
            return Err(InvalidBlockError::WrongTime {
                expected: expected.millis(),
                actual: header.time.millis(),
            });
        }
    }

    if !state.validators.has_address(&header.proposer_address) {
        return Err(InvalidBlockError::UnknownProposer {
            address: header.proposer_address,
        });
    }
    Ok(())
}

/// Execute and commit `block` against `app` without touching the state. Used by replay, where the state
/// is already ahead of the application. `last_validators` are the validators that signed
/// `block.last_commit`. Returns the application's new app hash.
pub fn exec_commit_block(
    app: &mut dyn AppConn,
    block: &Block,
    last_validators: &ValidatorSet,
) -> Result<AppHash, BlockExecutionError> {
    exec_block_on_app(app, block, last_validators)?;
    Ok(app.commit()?.data)
}

/// Run `begin_block`, `deliver_tx` for every transaction, and `end_block`.
fn exec_block_on_app(
    app: &mut dyn AppConn,
    block: &Block,
    last_validators: &ValidatorSet,
) -> Result<ABCIResponses, BlockExecutionError> {
    let last_commit_info = LastCommitInfo {
        round: block.last_commit.round().unwrap_or_default(),
        votes: last_validators
            .validators()
            .iter()
            .enumerate()
            .map(|(index, validator)| VoteInfo {
                address: validator.address,
                power: validator.voting_power,
                signed_last_block: block.last_commit.get_by_index(index).is_some(),
            })
            .collect(),
    };

    app.begin_block(BeginBlockRequest {
        hash: block.hash(),
        header: block.header.clone(),
        last_commit_info,
    })?;

    let mut deliver_txs = Vec::with_capacity(block.txs.len());
    let (mut valid_txs, mut invalid_txs) = (0, 0);
    for tx in &block.txs {
        let response = app.deliver_tx(tx)?;
        if response.is_ok() {
            valid_txs += 1;
        } else {
            log::debug!("Invalid tx: code {}, log {}", response.code, response.log);
            invalid_txs += 1;
        }
        deliver_txs.push(response);
    }

    let end_block = app.end_block(EndBlockRequest {
        height: block.height(),
    })?;

    log::info!(
        "Executed block. height: {}, valid txs: {}, invalid txs: {}",
        block.height(),
        valid_txs,
        invalid_txs
    );

    Ok(ABCIResponses {
        deliver_txs,
        end_block,
    })
}

/// Compute the state after `block`, except for its app hash, which is only known after the application
/// commits.
pub fn update_state(
    state: &State,
    block_id: BlockID,
    block: &Block,
    abci_responses: &ABCIResponses,
) -> Result<State, BlockExecutionError> {
    let header = &block.header;

    let mut next_validators = state.next_validators.clone();
    let mut last_height_validators_changed = state.last_height_validators_changed;
    let validator_updates = &abci_responses.end_block.validator_updates;
    if !validator_updates.is_empty() {
        next_validators.update_with_change_set(validator_updates, true)?;
        // Validators returned at `h` decide block `h + 2`.
        last_height_validators_changed = header.height + 2;
        log::info!("Updates to validators: {:?}", validator_updates);
    }
    next_validators.increment_proposer_priority(1);

    let mut consensus_params = state.consensus_params;
    let mut last_height_consensus_params_changed = state.last_height_consensus_params_changed;
    if abci_responses.end_block.consensus_param_updates.block.is_some() {
        consensus_params = state
            .consensus_params
            .update(&abci_responses.end_block.consensus_param_updates);
        consensus_params.validate()?;
        last_height_consensus_params_changed = header.height.next();
    }

    Ok(State {
        chain_id: state.chain_id.clone(),
        last_block_height: header.height,
        last_block_total_tx: state.last_block_total_tx + header.num_txs,
        last_block_id: Some(block_id),
        last_block_time: header.time,
        next_validators,
        validators: state.next_validators.clone(),
        last_validators: state.validators.clone(),
        last_height_validators_changed,
        consensus_params,
        last_height_consensus_params_changed,
        last_results_hash: abci_responses.results_hash(),
        app_hash: AppHash::default(),
    })
}

#[derive(Debug)]
pub enum InvalidBlockError {
    Malformed(BlockError),
    WrongChainID,
    WrongHeight { expected: Height, actual: Height },
    WrongLastBlockID,
    WrongAppHash { expected: AppHash, actual: AppHash },
    WrongConsensusHash,
    WrongLastResultsHash,
    WrongValidatorsHash,
    WrongNextValidatorsHash,
    WrongTotalTxs,
    NonEmptyFirstLastCommit,
    InvalidLastCommit(CommitVerificationError),
    NonMonotonicTime,
    WrongTime { expected: u64, actual: u64 },
    UnknownProposer { address: Address },
}

impl From<BlockError> for InvalidBlockError {
    fn from(value: BlockError) -> Self {
        InvalidBlockError::Malformed(value)
    }
}

impl From<CommitVerificationError> for InvalidBlockError {
    fn from(value: CommitVerificationError) -> Self {
        InvalidBlockError::InvalidLastCommit(value)
    }
}

#[derive(Debug)]
pub enum BlockExecutionError {
    InvalidBlock(InvalidBlockError),
    App(AppConnError),
    StateStore(StateStoreError),
    InvalidValidatorUpdates(ValidatorSetError),
    InvalidConsensusParams(ConsensusParamsError),
    Mempool(MempoolError),
}

impl From<InvalidBlockError> for BlockExecutionError {
    fn from(value: InvalidBlockError) -> Self {
        BlockExecutionError::InvalidBlock(value)
    }
}

impl From<AppConnError> for BlockExecutionError {
    fn from(value: AppConnError) -> Self {
        BlockExecutionError::App(value)
    }
}

impl From<StateStoreError> for BlockExecutionError {
    fn from(value: StateStoreError) -> Self {
        BlockExecutionError::StateStore(value)
    }
}

impl From<ValidatorSetError> for BlockExecutionError {
    fn from(value: ValidatorSetError) -> Self {
        BlockExecutionError::InvalidValidatorUpdates(value)
    }
}

impl From<ConsensusParamsError> for BlockExecutionError {
    fn from(value: ConsensusParamsError) -> Self {
        BlockExecutionError::InvalidConsensusParams(value)
    }
}

impl From<MempoolError> for BlockExecutionError {
    fn from(value: MempoolError) -> Self {
        BlockExecutionError::Mempool(value)
    }
}
