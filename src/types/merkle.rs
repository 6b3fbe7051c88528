/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A simple binary Merkle tree over SHA256, used to commit to the parts of a block and to the
//! transactions and validators referenced by a block header.
//!
//! Leaves are hashed as `H(0x00 || leaf)` and inner nodes as `H(0x01 || left || right)`. A tree of `n`
//! leaves is split so that its left subtree holds the largest power of two strictly smaller than `n`.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::Digest;

use super::{basic::CryptoHash, crypto::CryptoHasher};

const LEAF_PREFIX: u8 = 0;
const INNER_PREFIX: u8 = 1;

fn leaf_hash(leaf: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf);
    CryptoHash::new(hasher.finalize().into())
}

fn inner_hash(left: &CryptoHash, right: &CryptoHash) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update([INNER_PREFIX]);
    hasher.update(left.bytes());
    hasher.update(right.bytes());
    CryptoHash::new(hasher.finalize().into())
}

fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Compute the root of the tree with `items` as leaves. The root of an empty tree is the hash of the
/// empty byte sequence.
pub fn hash_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> CryptoHash {
    match items.len() {
        0 => CryptoHash::digest(&[]),
        1 => leaf_hash(items[0].as_ref()),
        n => {
            let k = split_point(n);
            inner_hash(
                &hash_from_byte_slices(&items[..k]),
                &hash_from_byte_slices(&items[k..]),
            )
        }
    }
}

/// Proof that a leaf is included at `index` in a tree of `total` leaves.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Proof {
    pub total: u32,
    pub index: u32,
    pub leaf_hash: CryptoHash,
    /// Sibling hashes from the leaf's level up to (but excluding) the root.
    pub aunts: Vec<CryptoHash>,
}

impl Proof {
    /// Check that this proof proves that `leaf` is a member of the tree with the given `root`.
    pub fn verify(&self, root: &CryptoHash, leaf: &[u8]) -> bool {
        if leaf_hash(leaf) != self.leaf_hash {
            return false;
        }
        match compute_hash_from_aunts(
            self.index as usize,
            self.total as usize,
            self.leaf_hash,
            &self.aunts,
        ) {
            Some(computed) => computed == *root,
            None => false,
        }
    }
}

fn compute_hash_from_aunts(
    index: usize,
    total: usize,
    leaf_hash: CryptoHash,
    aunts: &[CryptoHash],
) -> Option<CryptoHash> {
    if index >= total {
        return None;
    }
    match total {
        0 => None,
        1 => aunts.is_empty().then_some(leaf_hash),
        _ => {
            let (top, rest) = aunts.split_last()?;
            let num_left = split_point(total);
            if index < num_left {
                let left = compute_hash_from_aunts(index, num_left, leaf_hash, rest)?;
                Some(inner_hash(&left, top))
            } else {
                let right =
                    compute_hash_from_aunts(index - num_left, total - num_left, leaf_hash, rest)?;
                Some(inner_hash(top, &right))
            }
        }
    }
}

/// Compute the root of the tree with `items` as leaves, together with an inclusion proof for every
/// leaf.
pub fn proofs_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> (CryptoHash, Vec<Proof>) {
    let leaf_hashes: Vec<CryptoHash> = items.iter().map(|item| leaf_hash(item.as_ref())).collect();
    let mut aunts: Vec<Vec<CryptoHash>> = vec![Vec::new(); items.len()];
    let root = if leaf_hashes.is_empty() {
        CryptoHash::digest(&[])
    } else {
        build_trails(&leaf_hashes, &mut aunts, 0)
    };

    let total = items.len() as u32;
    let proofs = leaf_hashes
        .into_iter()
        .zip(aunts)
        .enumerate()
        .map(|(index, (leaf_hash, aunts))| Proof {
            total,
            index: index as u32,
            leaf_hash,
            aunts,
        })
        .collect();

    (root, proofs)
}

fn build_trails(hashes: &[CryptoHash], aunts: &mut [Vec<CryptoHash>], offset: usize) -> CryptoHash {
    let n = hashes.len();
    if n == 1 {
        return hashes[0];
    }
    let k = split_point(n);
    let left = build_trails(&hashes[..k], aunts, offset);
    let right = build_trails(&hashes[k..], aunts, offset + k);
    for trail in &mut aunts[offset..offset + k] {
        trail.push(right);
    }
    for trail in &mut aunts[offset + k..offset + n] {
        trail.push(left);
    }
    inner_hash(&left, &right)
}
