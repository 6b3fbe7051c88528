/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Blocks are gossiped in fixed-size parts. A [PartSet] holds the parts of one block, each carrying a
//! Merkle proof against the [PartSetHeader] hash that proposals and votes commit to, so that parts can
//! be verified independently as they arrive from different peers.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{basic::CryptoHash, bit_array::BitArray, merkle, params::MAX_BLOCK_SIZE_BYTES};

/// Size of every part but the last.
pub const BLOCK_PART_SIZE_BYTES: usize = 65536;

/// Number of parts of the largest possible block.
pub const MAX_BLOCK_PARTS_COUNT: u32 = (MAX_BLOCK_SIZE_BYTES / BLOCK_PART_SIZE_BYTES as u64) as u32 + 1;

#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, BorshSerialize, BorshDeserialize,
)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: CryptoHash,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0
    }
}

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: merkle::Proof,
}

impl Part {
    pub fn validate_basic(&self) -> Result<(), PartSetError> {
        if self.bytes.len() > BLOCK_PART_SIZE_BYTES {
            return Err(PartSetError::PartTooLarge {
                index: self.index,
                size: self.bytes.len(),
            });
        }
        if self.proof.index != self.index {
            return Err(PartSetError::InvalidProof { index: self.index });
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PartSet {
    total: u32,
    hash: CryptoHash,
    parts: Vec<Option<Part>>,
    parts_bit_array: BitArray,
    count: u32,
}

impl PartSet {
    /// Split `data` into parts of `part_size` bytes and compute their Merkle proofs.
    pub fn from_data(data: &[u8], part_size: usize) -> PartSet {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(part_size).collect()
        };
        let (root, proofs) = merkle::proofs_from_byte_slices(&chunks);

        let total = chunks.len();
        let mut parts_bit_array = BitArray::new(total);
        let parts = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (chunk, proof))| {
                parts_bit_array.set_index(index, true);
                Some(Part {
                    index: index as u32,
                    bytes: chunk.to_vec(),
                    proof,
                })
            })
            .collect();

        PartSet {
            total: total as u32,
            hash: root,
            parts,
            parts_bit_array,
            count: total as u32,
        }
    }

    /// Create an empty part set that accepts the parts committed to by `header`.
    pub fn from_header(header: &PartSetHeader) -> PartSet {
        PartSet {
            total: header.total,
            hash: header.hash,
            parts: vec![None; header.total as usize],
            parts_bit_array: BitArray::new(header.total as usize),
            count: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        PartSetHeader {
            total: self.total,
            hash: self.hash,
        }
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header() == *header
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn bit_array(&self) -> &BitArray {
        &self.parts_bit_array
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }

    pub fn get_part(&self, index: usize) -> Option<&Part> {
        self.parts.get(index).and_then(|part| part.as_ref())
    }

    /// Add a part, verifying its proof. Returns `Ok(false)` if the part is already present.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        let index = part.index as usize;
        if index >= self.parts.len() {
            return Err(PartSetError::UnexpectedIndex {
                index: part.index,
                total: self.total,
            });
        }
        if self.parts[index].is_some() {
            return Ok(false);
        }
        part.validate_basic()?;
        if part.proof.total != self.total || !part.proof.verify(&self.hash, &part.bytes) {
            return Err(PartSetError::InvalidProof { index: part.index });
        }

        self.parts[index] = Some(part);
        self.parts_bit_array.set_index(index, true);
        self.count += 1;
        Ok(true)
    }

    /// Concatenate the bytes of all parts.
    pub fn assemble(&self) -> Result<Vec<u8>, PartSetError> {
        if !self.is_complete() {
            return Err(PartSetError::Incomplete {
                count: self.count,
                total: self.total,
            });
        }
        Ok(self
            .parts
            .iter()
            .flatten()
            .flat_map(|part| part.bytes.iter().copied())
            .collect())
    }
}

#[derive(Debug)]
pub enum PartSetError {
    UnexpectedIndex { index: u32, total: u32 },
    InvalidProof { index: u32 },
    PartTooLarge { index: u32, size: usize },
    Incomplete { count: u32, total: u32 },
}
