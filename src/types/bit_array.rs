/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A fixed-size, compact set of validator indices.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Display, Formatter};

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct BitArray {
    bits: u32,
    elems: Vec<u64>,
}

impl BitArray {
    pub fn new(bits: usize) -> BitArray {
        BitArray {
            bits: bits as u32,
            elems: vec![0; (bits + 63) / 64],
        }
    }

    pub fn size(&self) -> usize {
        self.bits as usize
    }

    /// Whether the backing words match the size. Arrays decoded from peers may not.
    pub fn is_well_formed(&self) -> bool {
        self.elems.len() == (self.size() + 63) / 64
    }

    pub fn get_index(&self, index: usize) -> bool {
        if index >= self.size() {
            return false;
        }
        self.elems
            .get(index / 64)
            .map_or(false, |elem| elem & (1 << (index % 64)) != 0)
    }

    /// Indices of the bits that are set, in increasing order.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size()).filter(move |index| self.get_index(*index))
    }

    /// Set the bit at `index`. Returns false if `index` is out of range.
    pub fn set_index(&mut self, index: usize, value: bool) -> bool {
        if index >= self.size() {
            return false;
        }
        match self.elems.get_mut(index / 64) {
            Some(elem) if value => *elem |= 1 << (index % 64),
            Some(elem) => *elem &= !(1 << (index % 64)),
            None => return false,
        }
        true
    }

    pub fn count_ones(&self) -> usize {
        self.elems.iter().map(|elem| elem.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_ones() == self.size()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.iter().all(|elem| *elem == 0)
    }

    /// Bits set in `self` and not in `other`.
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let mut result = self.clone();
        for (elem, other) in result.elems.iter_mut().zip(other.elems.iter()) {
            *elem &= !other;
        }
        result
    }

    /// Bits set in either `self` or `other`, sized like the larger of the two.
    pub fn or(&self, other: &BitArray) -> BitArray {
        let (mut result, smaller) = if self.bits >= other.bits {
            (self.clone(), other)
        } else {
            (other.clone(), self)
        };
        for (elem, other) in result.elems.iter_mut().zip(smaller.elems.iter()) {
            *elem |= other;
        }
        result
    }

    /// Overwrite `self` with `other` if both arrays have the same size.
    pub fn update(&mut self, other: &BitArray) {
        if self.bits == other.bits && self.elems.len() == other.elems.len() {
            self.elems.copy_from_slice(&other.elems);
        }
    }
}

impl Display for BitArray {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let bits: String = (0..self.size())
            .map(|index| if self.get_index(index) { 'x' } else { '_' })
            .collect();
        write!(f, "BA{{{}:{}}}", self.size(), bits)
    }
}
