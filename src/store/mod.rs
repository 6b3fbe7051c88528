/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Persistent storage of committed blocks.
//!
//! The engine only depends on the [BlockStore] trait. [KVBlockStore] is a reference implementation on top
//! of a user-provided [KVStore]. Blocks are stored as their parts so that they can be served to peers
//! part by part, next to their [metadata](BlockMeta) and two commits: the one included in the next block,
//! and the one this node saw when it decided the block (which may contain different precommits).

use borsh::{BorshDeserialize, BorshSerialize};

use crate::kv_store::{self, concat, KVGetError, KVStore, Key, WriteBatch};
use crate::types::{
    basic::Height,
    block::{Block, BlockID, BlockMeta, Commit},
    part_set::{Part, PartSet},
};

pub trait BlockStore: Send {
    /// Height of the highest stored block, or 0 if the store is empty.
    fn height(&self) -> Height;

    fn load_block_meta(&self, height: Height) -> Result<Option<BlockMeta>, BlockStoreError>;

    fn load_block(&self, height: Height) -> Result<Option<Block>, BlockStoreError>;

    fn load_block_part(&self, height: Height, index: u32) -> Result<Option<Part>, BlockStoreError>;

    /// The commit for block `height`, as included in block `height + 1`.
    fn load_block_commit(&self, height: Height) -> Result<Option<Commit>, BlockStoreError>;

    /// The commit for block `height` that this node collected itself.
    fn load_seen_commit(&self, height: Height) -> Result<Option<Commit>, BlockStoreError>;

    /// Store `block`, which must be at height [height](BlockStore::height) + 1, its complete `parts`,
    /// and the commit this node saw for it.
    fn save_block(
        &mut self,
        block: &Block,
        parts: &PartSet,
        seen_commit: &Commit,
    ) -> Result<(), BlockStoreError>;
}

pub struct KVBlockStore<K: KVStore> {
    kv_store: K,
    height: Height,
}

impl<K: KVStore> KVBlockStore<K> {
    pub fn new(kv_store: K) -> Result<KVBlockStore<K>, BlockStoreError> {
        let height = kv_store.block_store_height()?;
        Ok(KVBlockStore { kv_store, height })
    }
}

impl<K: KVStore> BlockStore for KVBlockStore<K> {
    fn height(&self) -> Height {
        self.height
    }

    fn load_block_meta(&self, height: Height) -> Result<Option<BlockMeta>, BlockStoreError> {
        Ok(self.kv_store.block_meta(height)?)
    }

    fn load_block(&self, height: Height) -> Result<Option<Block>, BlockStoreError> {
        let block_meta = match self.kv_store.block_meta(height)? {
            Some(block_meta) => block_meta,
            None => return Ok(None),
        };

        let mut bytes = Vec::new();
        for index in 0..block_meta.block_id.parts_header.total {
            let part = self.kv_store.block_part(height, index)?.ok_or(
                KVGetError::ValueExpectedButNotFound {
                    key: Key::BlockPart { height, index },
                },
            )?;
            bytes.extend_from_slice(&part.bytes);
        }
        let block = Block::deserialize(&mut bytes.as_slice())
            .map_err(|err| BlockStoreError::CorruptBlock { height, source: err })?;
        Ok(Some(block))
    }

    fn load_block_part(&self, height: Height, index: u32) -> Result<Option<Part>, BlockStoreError> {
        Ok(self.kv_store.block_part(height, index)?)
    }

    fn load_block_commit(&self, height: Height) -> Result<Option<Commit>, BlockStoreError> {
        Ok(self.kv_store.block_commit(height)?)
    }

    fn load_seen_commit(&self, height: Height) -> Result<Option<Commit>, BlockStoreError> {
        Ok(self.kv_store.seen_commit(height)?)
    }

    fn save_block(
        &mut self,
        block: &Block,
        parts: &PartSet,
        seen_commit: &Commit,
    ) -> Result<(), BlockStoreError> {
        let height = block.height();
        if height != self.height.next() {
            return Err(BlockStoreError::NonContiguousHeight {
                expected: self.height.next(),
                actual: height,
            });
        }
        if !parts.is_complete() {
            return Err(BlockStoreError::IncompletePartSet { height });
        }

        let mut wb = K::WriteBatch::new();
        let height_bytes = height.to_be_bytes();

        let block_meta = BlockMeta {
            block_id: BlockID::new(block.hash(), parts.header()),
            header: block.header.clone(),
        };
        wb.set(
            &concat(&kv_store::BLOCK_META, &height_bytes),
            &block_meta.try_to_vec()?,
        );
        for index in 0..parts.total() {
            if let Some(part) = parts.get_part(index as usize) {
                wb.set(
                    &concat(
                        &kv_store::BLOCK_PART,
                        &concat(&height_bytes, &index.to_be_bytes()),
                    ),
                    &part.try_to_vec()?,
                );
            }
        }
        if let Some(prev_height) = height.prev() {
            if !block.last_commit.is_empty() {
                wb.set(
                    &concat(&kv_store::BLOCK_COMMIT, &prev_height.to_be_bytes()),
                    &block.last_commit.try_to_vec()?,
                );
            }
        }
        wb.set(
            &concat(&kv_store::SEEN_COMMIT, &height_bytes),
            &seen_commit.try_to_vec()?,
        );
        wb.set(&kv_store::BLOCK_STORE_HEIGHT, &height.try_to_vec()?);

        self.kv_store.write(wb);
        self.height = height;
        Ok(())
    }
}

#[derive(Debug)]
pub enum BlockStoreError {
    KVGetError(KVGetError),
    SerializeError(std::io::Error),
    CorruptBlock {
        height: Height,
        source: std::io::Error,
    },
    NonContiguousHeight {
        expected: Height,
        actual: Height,
    },
    IncompletePartSet {
        height: Height,
    },
}

impl From<KVGetError> for BlockStoreError {
    fn from(value: KVGetError) -> Self {
        BlockStoreError::KVGetError(value)
    }
}

impl From<std::io::Error> for BlockStoreError {
    fn from(value: std::io::Error) -> Self {
        BlockStoreError::SerializeError(value)
    }
}
