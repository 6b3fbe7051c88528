/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Persistence of the [State], and of the per-height history (validator sets, consensus params, and
//! block execution results) that replay needs.

use borsh::BorshSerialize;

use crate::app::ABCIResponses;
use crate::kv_store::{self, concat, KVGetError, KVStore, WriteBatch};
use crate::types::{
    basic::Height,
    genesis::{GenesisDoc, GenesisError},
    params::ConsensusParams,
    validators::ValidatorSet,
};

use super::state::{State, ValidatorsInfo};

#[derive(Clone)]
pub struct StateStore<K: KVStore> {
    kv_store: K,
}

impl<K: KVStore> StateStore<K> {
    pub fn new(kv_store: K) -> StateStore<K> {
        StateStore { kv_store }
    }

    pub fn load_state(&self) -> Result<Option<State>, StateStoreError> {
        Ok(self.kv_store.state()?)
    }

    /// Load the persisted state, or build (and persist) the state described by `genesis` if none exists.
    pub fn load_state_from_db_or_genesis(
        &mut self,
        genesis: &GenesisDoc,
    ) -> Result<State, StateStoreError> {
        if let Some(state) = self.load_state()? {
            return Ok(state);
        }
        let state = State::from_genesis(genesis)?;
        self.save_state(&state)?;
        Ok(state)
    }

    /// Persist `state`, together with the validator set and consensus params it determines for the
    /// following heights.
    pub fn save_state(&mut self, state: &State) -> Result<(), StateStoreError> {
        let mut wb = K::WriteBatch::new();
        let next_height = state.last_block_height.next();

        if next_height == Height::new(1) {
            // Genesis: the validators of height 1 are not saved by any previous call.
            set_validators_info(
                &mut wb,
                next_height,
                &ValidatorsInfo {
                    last_height_changed: next_height,
                    validator_set: state.validators.clone(),
                },
            )?;
        }
        set_validators_info(
            &mut wb,
            next_height.next(),
            &ValidatorsInfo {
                last_height_changed: state.last_height_validators_changed,
                validator_set: state.next_validators.clone(),
            },
        )?;
        wb.set(
            &concat(&kv_store::CONSENSUS_PARAMS, &next_height.to_be_bytes()),
            &state.consensus_params.try_to_vec()?,
        );
        wb.set(&kv_store::STATE, &state.try_to_vec()?);

        self.kv_store.write(wb);
        Ok(())
    }

    /// Persist the results of executing block `height`. Must be called before the application commits the
    /// block.
    pub fn save_abci_responses(
        &mut self,
        height: Height,
        abci_responses: &ABCIResponses,
    ) -> Result<(), StateStoreError> {
        let mut wb = K::WriteBatch::new();
        wb.set(
            &concat(&kv_store::ABCI_RESPONSES, &height.to_be_bytes()),
            &abci_responses.try_to_vec()?,
        );
        self.kv_store.write(wb);
        Ok(())
    }

    pub fn load_abci_responses(&self, height: Height) -> Result<ABCIResponses, StateStoreError> {
        self.kv_store
            .abci_responses(height)?
            .ok_or(StateStoreError::NoABCIResponsesForHeight { height })
    }

    /// The validator set that decides block `height`.
    pub fn load_validators(&self, height: Height) -> Result<ValidatorSet, StateStoreError> {
        self.kv_store
            .validators_info(height)?
            .map(|info| info.validator_set)
            .ok_or(StateStoreError::NoValidatorsForHeight { height })
    }

    pub fn load_consensus_params(&self, height: Height) -> Result<ConsensusParams, StateStoreError> {
        self.kv_store
            .consensus_params(height)?
            .ok_or(StateStoreError::NoConsensusParamsForHeight { height })
    }
}

fn set_validators_info<W: WriteBatch>(
    wb: &mut W,
    height: Height,
    info: &ValidatorsInfo,
) -> Result<(), StateStoreError> {
    wb.set(
        &concat(&kv_store::VALIDATORS_INFO, &height.to_be_bytes()),
        &info.try_to_vec()?,
    );
    Ok(())
}

#[derive(Debug)]
pub enum StateStoreError {
    KVGetError(KVGetError),
    SerializeError(std::io::Error),
    InvalidGenesis(GenesisError),
    NoABCIResponsesForHeight { height: Height },
    NoValidatorsForHeight { height: Height },
    NoConsensusParamsForHeight { height: Height },
}

impl From<KVGetError> for StateStoreError {
    fn from(value: KVGetError) -> Self {
        StateStoreError::KVGetError(value)
    }
}

impl From<std::io::Error> for StateStoreError {
    fn from(value: std::io::Error) -> Self {
        StateStoreError::SerializeError(value)
    }
}

impl From<GenesisError> for StateStoreError {
    fn from(value: GenesisError) -> Self {
        StateStoreError::InvalidGenesis(value)
    }
}
