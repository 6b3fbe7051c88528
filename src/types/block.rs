/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [Block] type and the types that identify and justify blocks.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Display, Formatter};

use super::{
    basic::{Address, AppHash, ChainID, CryptoHash, Height, Round, Timestamp, Tx},
    bit_array::BitArray,
    merkle,
    part_set::{PartSet, PartSetHeader},
    vote::{Vote, VoteType},
};

/// Identifies a block by its hash and by the header of the part set it is gossiped in.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, BorshSerialize, BorshDeserialize,
)]
pub struct BlockID {
    pub hash: CryptoHash,
    pub parts_header: PartSetHeader,
}

impl BlockID {
    pub fn new(hash: CryptoHash, parts_header: PartSetHeader) -> BlockID {
        BlockID { hash, parts_header }
    }
}

impl Display for BlockID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.hash, self.parts_header.total, self.parts_header.hash
        )
    }
}

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Header {
    pub chain_id: ChainID,
    pub height: Height,
    pub time: Timestamp,
    pub num_txs: u64,
    pub total_txs: u64,
    /// `None` for the first block.
    pub last_block_id: Option<BlockID>,
    pub last_commit_hash: CryptoHash,
    pub data_hash: CryptoHash,
    pub validators_hash: CryptoHash,
    pub next_validators_hash: CryptoHash,
    pub consensus_hash: CryptoHash,
    /// The application's hash after executing the previous block.
    pub app_hash: AppHash,
    /// Hash of the transaction results of the previous block.
    pub last_results_hash: CryptoHash,
    pub proposer_address: Address,
}

impl Header {
    pub fn hash(&self) -> CryptoHash {
        CryptoHash::digest(&self.try_to_vec().unwrap_or_default())
    }
}

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Tx>,
    pub last_commit: Commit,
}

impl Block {
    pub fn hash(&self) -> CryptoHash {
        self.header.hash()
    }

    pub fn height(&self) -> Height {
        self.header.height
    }

    pub fn hashes_to(&self, hash: &CryptoHash) -> bool {
        self.hash() == *hash
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.try_to_vec().unwrap_or_default()
    }

    pub fn make_part_set(&self, part_size: usize) -> PartSet {
        PartSet::from_data(&self.bytes(), part_size)
    }

    pub fn txs_hash(txs: &[Tx]) -> CryptoHash {
        let leaves: Vec<&[u8]> = txs.iter().map(|tx| tx.bytes()).collect();
        merkle::hash_from_byte_slices(&leaves)
    }

    /// Stateless sanity checks: the header commits to this block's transactions and last commit.
    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.header.num_txs != self.txs.len() as u64 {
            return Err(BlockError::WrongNumTxs {
                expected: self.txs.len() as u64,
                actual: self.header.num_txs,
            });
        }
        if self.header.data_hash != Block::txs_hash(&self.txs) {
            return Err(BlockError::WrongDataHash);
        }
        if self.header.last_commit_hash != self.last_commit.hash() {
            return Err(BlockError::WrongLastCommitHash);
        }
        self.last_commit.validate_basic()?;
        Ok(())
    }
}

/// The precommits that justify committing a block, indexed by validator index. `None` where the
/// validator's precommit was not seen. Precommits for other blocks (or nil) may be included but do not
/// count towards the commit.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub block_id: BlockID,
    pub precommits: Vec<Option<Vote>>,
}

impl Commit {
    /// The commit carried by the first block, which has no predecessor to justify.
    pub fn empty() -> Commit {
        Commit {
            block_id: BlockID::default(),
            precommits: Vec::new(),
        }
    }

    fn first_precommit(&self) -> Option<&Vote> {
        self.precommits.iter().flatten().next()
    }

    pub fn height(&self) -> Option<Height> {
        self.first_precommit().map(|vote| vote.height)
    }

    pub fn round(&self) -> Option<Round> {
        self.first_precommit().map(|vote| vote.round)
    }

    pub fn size(&self) -> usize {
        self.precommits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_precommit().is_none()
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Vote> {
        self.precommits.get(index).and_then(|vote| vote.as_ref())
    }

    pub fn bit_array(&self) -> BitArray {
        let mut bit_array = BitArray::new(self.precommits.len());
        for (index, precommit) in self.precommits.iter().enumerate() {
            bit_array.set_index(index, precommit.is_some());
        }
        bit_array
    }

    pub fn hash(&self) -> CryptoHash {
        let leaves: Vec<Vec<u8>> = self
            .precommits
            .iter()
            .map(|precommit| precommit.try_to_vec().unwrap_or_default())
            .collect();
        merkle::hash_from_byte_slices(&leaves)
    }

    pub fn validate_basic(&self) -> Result<(), BlockError> {
        let (height, round) = match self.first_precommit() {
            Some(first) => (first.height, first.round),
            None => return Ok(()),
        };
        for precommit in self.precommits.iter().flatten() {
            if precommit.vote_type != VoteType::Precommit
                || precommit.height != height
                || precommit.round != round
            {
                return Err(BlockError::InvalidCommitPrecommit {
                    index: precommit.validator_index,
                });
            }
        }
        Ok(())
    }
}

/// Everything but the transactions and last commit of a stored block.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct BlockMeta {
    pub block_id: BlockID,
    pub header: Header,
}

#[derive(Debug)]
pub enum BlockError {
    WrongNumTxs { expected: u64, actual: u64 },
    WrongDataHash,
    WrongLastCommitHash,
    InvalidCommitPrecommit { index: u32 },
}
