/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The narrow request/response interface through which the engine reaches the deterministic application.
//!
//! Besides implementing the methods of [AppConn], implementors are expected to be *deterministic*: every
//! replica that calls the same sequence of methods with the same arguments must end up with the same
//! app hash. Methods are always called sequentially, in the order:
//!
//! ```text
//! begin_block, deliver_tx*, end_block, commit
//! ```
//!
//! for each block, after a single call to [info](AppConn::info) (and, on a fresh chain,
//! [init_chain](AppConn::init_chain)) at startup.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    basic::{Address, AppHash, ChainID, CryptoHash, Height, Power, Round, Timestamp, Tx},
    block::Header,
    merkle,
    params::{ConsensusParamUpdates, ConsensusParams},
    validators::ValidatorUpdate,
};

pub trait AppConn: Send {
    fn info(&mut self) -> Result<InfoResponse, AppConnError>;

    /// Called once, when the application is at height 0.
    fn init_chain(&mut self, request: InitChainRequest) -> Result<InitChainResponse, AppConnError>;

    fn begin_block(&mut self, request: BeginBlockRequest) -> Result<(), AppConnError>;

    fn deliver_tx(&mut self, tx: &Tx) -> Result<DeliverTxResponse, AppConnError>;

    fn end_block(&mut self, request: EndBlockRequest) -> Result<EndBlockResponse, AppConnError>;

    /// Persist the effects of the current block and return the resulting app hash.
    fn commit(&mut self) -> Result<CommitResponse, AppConnError>;
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct InfoResponse {
    pub last_block_height: Height,
    pub last_block_app_hash: AppHash,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InitChainRequest {
    pub time: Timestamp,
    pub chain_id: ChainID,
    pub consensus_params: ConsensusParams,
    pub validators: Vec<ValidatorUpdate>,
    pub app_state: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct InitChainResponse {
    /// Replaces the genesis consensus params if set.
    pub consensus_params: Option<ConsensusParams>,
    /// Replaces the genesis validators if non-empty.
    pub validators: Vec<ValidatorUpdate>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BeginBlockRequest {
    pub hash: CryptoHash,
    pub header: Header,
    pub last_commit_info: LastCommitInfo,
}

/// Which validators signed the previous block.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct LastCommitInfo {
    pub round: Round,
    pub votes: Vec<VoteInfo>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct VoteInfo {
    pub address: Address,
    pub power: Power,
    pub signed_last_block: bool,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, BorshSerialize, BorshDeserialize)]
pub struct DeliverTxResponse {
    /// 0 means success.
    pub code: u32,
    pub data: Vec<u8>,
    pub log: String,
    pub gas_wanted: i64,
    pub gas_used: i64,
}

impl DeliverTxResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EndBlockRequest {
    pub height: Height,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, BorshSerialize, BorshDeserialize)]
pub struct EndBlockResponse {
    pub validator_updates: Vec<ValidatorUpdate>,
    pub consensus_param_updates: ConsensusParamUpdates,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct CommitResponse {
    pub data: AppHash,
}

/// The results of executing a block, saved before the block is committed so that it can be replayed
/// against a [mock application](crate::consensus::replay::MockApp) after a crash.
#[derive(Clone, PartialEq, Eq, Debug, Default, BorshSerialize, BorshDeserialize)]
pub struct ABCIResponses {
    pub deliver_txs: Vec<DeliverTxResponse>,
    pub end_block: EndBlockResponse,
}

impl ABCIResponses {
    /// Merkle root of the deterministic parts (code and data) of the transaction results.
    pub fn results_hash(&self) -> CryptoHash {
        let leaves: Vec<Vec<u8>> = self
            .deliver_txs
            .iter()
            .map(|response| {
                (response.code, response.data.clone())
                    .try_to_vec()
                    .unwrap_or_default()
            })
            .collect();
        merkle::hash_from_byte_slices(&leaves)
    }
}

#[derive(Debug)]
pub enum AppConnError {
    /// The connection to the application failed.
    Connection(String),
    /// The application returned fewer or more results than expected.
    UnexpectedResponse(String),
}
