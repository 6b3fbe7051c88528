/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Consensus parameters: limits on block size and gas that every validator must agree on. They are
//! part of the replicated state and may be changed by the application at the end of a block.

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::CryptoHash;

/// Upper bound on [BlockParams::max_data_bytes].
pub const MAX_BLOCK_SIZE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct BlockParams {
    /// Maximum total size of the transactions in a block.
    pub max_data_bytes: u64,
    /// Maximum total gas wanted by the transactions in a block. Negative means unlimited.
    pub max_gas: i64,
    /// Minimum time increment between consecutive blocks, in milliseconds.
    pub time_iota_ms: u64,
}

impl Default for BlockParams {
    fn default() -> Self {
        BlockParams {
            max_data_bytes: 2 * 1024 * 1024,
            max_gas: -1,
            time_iota_ms: 1,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, BorshSerialize, BorshDeserialize)]
pub struct ConsensusParams {
    pub block: BlockParams,
}

impl ConsensusParams {
    pub fn hash(&self) -> CryptoHash {
        CryptoHash::digest(&self.try_to_vec().unwrap_or_default())
    }

    /// Return a copy of these parameters with the non-empty fields of `updates` applied.
    pub fn update(&self, updates: &ConsensusParamUpdates) -> ConsensusParams {
        let mut next = *self;
        if let Some(block) = updates.block {
            next.block = block;
        }
        next
    }

    pub fn validate(&self) -> Result<(), ConsensusParamsError> {
        if self.block.max_data_bytes == 0 {
            return Err(ConsensusParamsError::ZeroMaxDataBytes);
        }
        if self.block.max_data_bytes > MAX_BLOCK_SIZE_BYTES {
            return Err(ConsensusParamsError::MaxDataBytesTooLarge {
                max_data_bytes: self.block.max_data_bytes,
            });
        }
        if self.block.time_iota_ms == 0 {
            return Err(ConsensusParamsError::ZeroTimeIota);
        }
        Ok(())
    }
}

/// Changes to the consensus parameters returned by the application at the end of a block.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, BorshSerialize, BorshDeserialize)]
pub struct ConsensusParamUpdates {
    pub block: Option<BlockParams>,
}

#[derive(Debug)]
pub enum ConsensusParamsError {
    ZeroMaxDataBytes,
    MaxDataBytesTooLarge { max_data_bytes: u64 },
    ZeroTimeIota,
}
