//! A crash-recoverable implementation of the Tendermint BFT round engine.
//!
//! A set of validators with known voting powers agrees on one block per height. Each height proceeds in
//! rounds, and each round in steps: a proposer broadcasts a block, validators prevote, then precommit,
//! and a block is committed once +2/3 of the voting power precommits it. Every message that drives the
//! engine is written to a [write-ahead log](wal) first, so that a restarted node resumes the height it
//! crashed in without signing anything that conflicts with what it already sent.
//!
//! The library user plugs in:
//! - The [application](app::AppConn) that executes committed blocks,
//! - The [mempool](mempool::Mempool) that proposals are reaped from,
//! - Peer-to-peer [networking](networking::Network),
//! - A [key-value store](kv_store::KVStore) for the state and the blocks,
//!
//! and then [starts a node](node::NodeSpec::start).

pub mod app;

pub mod config;

pub mod consensus;

pub(crate) mod event_bus;

pub mod events;

pub mod kv_store;

pub mod logging;

pub mod mempool;

pub mod networking;

pub mod node;

pub mod service;

pub mod state;

pub mod store;

pub mod types;

pub mod wal;
