/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [Vote] type.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Display, Formatter};

use super::{
    basic::{Address, ChainID, Height, Round, SignatureBytes, Timestamp},
    block::BlockID,
    crypto::PublicKeyBytes,
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, BorshSerialize, BorshDeserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl Display for VoteType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => f.write_str("Prevote"),
            VoteType::Precommit => f.write_str("Precommit"),
        }
    }
}

/// A signed prevote or precommit. `block_id` is `None` for a vote for nil, i.e., for no block.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: Height,
    pub round: Round,
    pub block_id: Option<BlockID>,
    pub timestamp: Timestamp,
    pub validator_address: Address,
    pub validator_index: u32,
    pub signature: SignatureBytes,
}

impl Vote {
    /// The bytes that a validator signs. Binds the vote to `chain_id` and excludes the signature and the
    /// validator's identity, which are checked separately.
    pub fn sign_bytes(&self, chain_id: &ChainID) -> Vec<u8> {
        (
            chain_id.clone(),
            self.vote_type,
            self.height,
            self.round,
            self.block_id,
            self.timestamp,
        )
            .try_to_vec()
            .unwrap_or_default()
    }

    /// Check that the vote was cast by the holder of `pub_key`.
    pub fn verify(&self, chain_id: &ChainID, pub_key: &PublicKeyBytes) -> Result<(), VoteError> {
        if pub_key.address() != self.validator_address {
            return Err(VoteError::InvalidValidatorAddress {
                address: self.validator_address,
            });
        }
        if !pub_key.verify(&self.sign_bytes(chain_id), &self.signature) {
            return Err(VoteError::InvalidSignature {
                address: self.validator_address,
            });
        }
        Ok(())
    }

    pub fn is_nil(&self) -> bool {
        self.block_id.is_none()
    }

    /// Returns true if `self` and `other` are the same vote except possibly for their timestamps and
    /// signatures.
    pub fn only_differs_by_timestamp(&self, other: &Vote) -> bool {
        self.vote_type == other.vote_type
            && self.height == other.height
            && self.round == other.round
            && self.block_id == other.block_id
            && self.validator_address == other.validator_address
            && self.validator_index == other.validator_index
    }

    pub fn validate_basic(&self) -> Result<(), VoteError> {
        if let Some(block_id) = &self.block_id {
            if block_id.parts_header.is_zero() {
                return Err(VoteError::MalformedBlockID);
            }
        }
        Ok(())
    }
}

impl Display for Vote {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let block = match &self.block_id {
            Some(block_id) => block_id.hash.to_string(),
            None => String::from("nil"),
        };
        write!(
            f,
            "Vote{{{}:{} {}/{} {} {} @{}}}",
            self.validator_index,
            self.validator_address,
            self.height,
            self.round,
            self.vote_type,
            block,
            self.timestamp
        )
    }
}

#[derive(Debug)]
pub enum VoteError {
    InvalidValidatorAddress { address: Address },
    InvalidSignature { address: Address },
    MalformedBlockID,
}
