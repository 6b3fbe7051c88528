/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable persistence of the replicated [State](crate::state::State) and of the
//! [block store](crate::store::KVBlockStore).
//!
//! The library user provides a key-value store by implementing [KVStore]. Every variable is stored as a
//! Borsh-serialized value under a key formed by concatenating a one-byte prefix (defined as constants in
//! this module) with, for mappings, the big-endian bytes of the height (and part index) it is indexed by.
//!
//! |Variable|Key|Value|
//! |---|---|---|
//! |State|`STATE`|[State](crate::state::State)|
//! |ABCI Responses|`ABCI_RESPONSES ++ height`|[ABCIResponses](crate::app::ABCIResponses)|
//! |Validators Info|`VALIDATORS_INFO ++ height`|[ValidatorsInfo](crate::state::ValidatorsInfo)|
//! |Consensus Params|`CONSENSUS_PARAMS ++ height`|[ConsensusParams]|
//! |Block Meta|`BLOCK_META ++ height`|[BlockMeta]|
//! |Block Part|`BLOCK_PART ++ height ++ index`|[Part]|
//! |Block Commit|`BLOCK_COMMIT ++ height`|[Commit] for `height`, as included in block `height + 1`|
//! |Seen Commit|`SEEN_COMMIT ++ height`|[Commit] for `height`, as seen locally|
//! |Block Store Height|`BLOCK_STORE_HEIGHT`|[Height]|

use std::fmt::Display;

use borsh::BorshDeserialize;

use crate::{
    app::ABCIResponses,
    state::{State, ValidatorsInfo},
    types::{
        basic::Height,
        block::{BlockMeta, Commit},
        params::ConsensusParams,
        part_set::Part,
    },
};

pub const STATE: [u8; 1] = [0];
pub const ABCI_RESPONSES: [u8; 1] = [1];
pub const VALIDATORS_INFO: [u8; 1] = [2];
pub const CONSENSUS_PARAMS: [u8; 1] = [3];
pub const BLOCK_META: [u8; 1] = [4];
pub const BLOCK_PART: [u8; 1] = [5];
pub const BLOCK_COMMIT: [u8; 1] = [6];
pub const SEEN_COMMIT: [u8; 1] = [7];
pub const BLOCK_STORE_HEIGHT: [u8; 1] = [8];

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;

    fn write(&mut self, wb: Self::WriteBatch);
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /* ↓↓↓ State ↓↓↓ */

    fn state(&self) -> Result<Option<State>, KVGetError> {
        deserialize_value(self.get(&STATE), Key::State)
    }

    fn abci_responses(&self, height: Height) -> Result<Option<ABCIResponses>, KVGetError> {
        deserialize_value(
            self.get(&concat(&ABCI_RESPONSES, &height.to_be_bytes())),
            Key::ABCIResponses { height },
        )
    }

    fn validators_info(&self, height: Height) -> Result<Option<ValidatorsInfo>, KVGetError> {
        deserialize_value(
            self.get(&concat(&VALIDATORS_INFO, &height.to_be_bytes())),
            Key::ValidatorsInfo { height },
        )
    }

    fn consensus_params(&self, height: Height) -> Result<Option<ConsensusParams>, KVGetError> {
        deserialize_value(
            self.get(&concat(&CONSENSUS_PARAMS, &height.to_be_bytes())),
            Key::ConsensusParams { height },
        )
    }

    /* ↓↓↓ Blocks ↓↓↓ */

    fn block_meta(&self, height: Height) -> Result<Option<BlockMeta>, KVGetError> {
        deserialize_value(
            self.get(&concat(&BLOCK_META, &height.to_be_bytes())),
            Key::BlockMeta { height },
        )
    }

    fn block_part(&self, height: Height, index: u32) -> Result<Option<Part>, KVGetError> {
        deserialize_value(
            self.get(&concat(
                &BLOCK_PART,
                &concat(&height.to_be_bytes(), &index.to_be_bytes()),
            )),
            Key::BlockPart { height, index },
        )
    }

    fn block_commit(&self, height: Height) -> Result<Option<Commit>, KVGetError> {
        deserialize_value(
            self.get(&concat(&BLOCK_COMMIT, &height.to_be_bytes())),
            Key::BlockCommit { height },
        )
    }

    fn seen_commit(&self, height: Height) -> Result<Option<Commit>, KVGetError> {
        deserialize_value(
            self.get(&concat(&SEEN_COMMIT, &height.to_be_bytes())),
            Key::SeenCommit { height },
        )
    }

    fn block_store_height(&self) -> Result<Height, KVGetError> {
        Ok(deserialize_value(self.get(&BLOCK_STORE_HEIGHT), Key::BlockStoreHeight)?
            .unwrap_or_default())
    }
}

fn deserialize_value<T: BorshDeserialize>(
    bytes: Option<Vec<u8>>,
    key: Key,
) -> Result<Option<T>, KVGetError> {
    match bytes {
        Some(bytes) => Ok(Some(
            T::deserialize(&mut bytes.as_slice())
                .map_err(|err| KVGetError::DeserializeValueError { key, source: err })?,
        )),
        None => Ok(None),
    }
}

/// Error when trying to read a value corresponding to a given key from the [key value store][KVStore].
#[derive(Debug)]
pub enum KVGetError {
    DeserializeValueError { key: Key, source: std::io::Error },
    ValueExpectedButNotFound { key: Key },
}

#[derive(Debug)]
pub enum Key {
    State,
    ABCIResponses { height: Height },
    ValidatorsInfo { height: Height },
    ConsensusParams { height: Height },
    BlockMeta { height: Height },
    BlockPart { height: Height, index: u32 },
    BlockCommit { height: Height },
    SeenCommit { height: Height },
    BlockStoreHeight,
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::State => write!(f, "State"),
            Key::ABCIResponses { height } => write!(f, "ABCI Responses at height {}", height),
            Key::ValidatorsInfo { height } => write!(f, "Validators Info at height {}", height),
            Key::ConsensusParams { height } => write!(f, "Consensus Params at height {}", height),
            Key::BlockMeta { height } => write!(f, "Block Meta at height {}", height),
            Key::BlockPart { height, index } => {
                write!(f, "Block Part {} at height {}", index, height)
            }
            Key::BlockCommit { height } => write!(f, "Block Commit at height {}", height),
            Key::SeenCommit { height } => write!(f, "Seen Commit at height {}", height),
            Key::BlockStoreHeight => write!(f, "Block Store Height"),
        }
    }
}

/// Concatenate two byteslices into one vector.
pub fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}
