//! Types and traits that are used across multiple components of the round engine.
//!
//! Types specific to a single component, e.g., the messages of the consensus protocol, can be found in
//! that component's module, e.g., [`crate::consensus::messages`].

pub mod basic;

pub mod bit_array;

pub mod block;

pub mod crypto;

pub mod genesis;

pub mod merkle;

pub mod params;

pub mod part_set;

pub mod proposal;

pub mod signer;

pub mod validators;

pub mod vote;

pub mod vote_set;
