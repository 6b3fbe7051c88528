/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The genesis document: the chain parameters and initial validator set every node starts from.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    basic::{AppHash, ChainID, Power, Timestamp},
    crypto::PublicKeyBytes,
    params::{ConsensusParams, ConsensusParamsError},
    validators::{Validator, ValidatorSet, ValidatorSetError},
};

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct GenesisValidator {
    pub pub_key: PublicKeyBytes,
    pub power: Power,
    pub name: String,
}

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct GenesisDoc {
    pub genesis_time: Timestamp,
    pub chain_id: ChainID,
    pub consensus_params: ConsensusParams,
    /// May be empty, in which case the application must return the validators from `init_chain`.
    pub validators: Vec<GenesisValidator>,
    pub app_hash: AppHash,
    /// Opaque initial application state, passed to `init_chain`.
    pub app_state: Vec<u8>,
}

impl GenesisDoc {
    pub fn validate(&self) -> Result<(), GenesisError> {
        if self.chain_id.as_str().is_empty() {
            return Err(GenesisError::EmptyChainID);
        }
        self.consensus_params.validate()?;
        for validator in &self.validators {
            if validator.power.int() == 0 {
                return Err(GenesisError::ZeroPowerValidator {
                    name: validator.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn validator_set(&self) -> Result<ValidatorSet, ValidatorSetError> {
        if self.validators.is_empty() {
            return Ok(ValidatorSet::default());
        }
        ValidatorSet::new(
            self.validators
                .iter()
                .map(|validator| Validator::new(validator.pub_key, validator.power))
                .collect(),
        )
    }
}

#[derive(Debug)]
pub enum GenesisError {
    EmptyChainID,
    ZeroPowerValidator { name: String },
    InvalidConsensusParams(ConsensusParamsError),
    InvalidValidatorSet(ValidatorSetError),
}

impl From<ConsensusParamsError> for GenesisError {
    fn from(value: ConsensusParamsError) -> Self {
        GenesisError::InvalidConsensusParams(value)
    }
}

impl From<ValidatorSetError> for GenesisError {
    fn from(value: ValidatorSetError) -> Self {
        GenesisError::InvalidValidatorSet(value)
    }
}
