/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Startup recovery: syncing the application with the block store and the state.
//!
//! A node can crash anywhere between storing a block, committing it in the application, and saving the
//! state after it. On restart, the [Handshaker] asks the application for the last height it committed,
//! and replays whatever blocks it is missing so that the application (height `A`), the block store
//! (height `S`), and the state (height `T`) agree again. Messages of the height the node was deciding
//! when it crashed are replayed separately, from the WAL, by
//! [ConsensusState::catchup_replay](super::state::ConsensusState::catchup_replay).
//!
//! |Case|Action|
//! |---|---|
//! |`S == 0`|Nothing to replay.|
//! |`S < A`|Error: the application is ahead of the block store.|
//! |`S < T` or `S > T + 1`|Error: the node's own stores are inconsistent.|
//! |`S == T`, `A < S`|Execute blocks `A+1..=S` against the application without touching the state.|
//! |`S == T`, `A == S`|Nothing to replay.|
//! |`S == T + 1`, `A < T`|Execute blocks `A+1..S` as above, then apply block `S` with the application.|
//! |`S == T + 1`, `A == T`|Apply block `S` with the application.|
//! |`S == T + 1`, `A == S`|The application committed `S` but the state was not saved: apply block `S` against a [MockApp] that returns the stored results.|
//!
//! After replay, the application's app hash must equal the state's.

use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::Sender;

use crate::app::{
    ABCIResponses, AppConn, AppConnError, BeginBlockRequest, CommitResponse, DeliverTxResponse,
    EndBlockRequest, EndBlockResponse, InfoResponse, InitChainRequest, InitChainResponse,
};
use crate::events::Event;
use crate::kv_store::KVStore;
use crate::mempool::EmptyMempool;
use crate::state::{
    execution::exec_commit_block, BlockExecutionError, BlockExecutor, State, StateStore,
    StateStoreError,
};
use crate::store::{BlockStore, BlockStoreError};
use crate::types::{
    basic::{AppHash, Height, Tx},
    genesis::GenesisDoc,
    validators::{Validator, ValidatorSet, ValidatorSetError, ValidatorUpdate},
};

pub struct Handshaker<'a, K: KVStore> {
    state_store: StateStore<K>,
    state: State,
    block_store: &'a dyn BlockStore,
    genesis: &'a GenesisDoc,
    event_publisher: Option<Sender<Event>>,
    n_blocks: u64,
}

impl<'a, K: KVStore> Handshaker<'a, K> {
    pub fn new(
        state_store: StateStore<K>,
        state: State,
        block_store: &'a dyn BlockStore,
        genesis: &'a GenesisDoc,
        event_publisher: Option<Sender<Event>>,
    ) -> Handshaker<'a, K> {
        Handshaker {
            state_store,
            state,
            block_store,
            genesis,
            event_publisher,
            n_blocks: 0,
        }
    }

    /// How many blocks were replayed against the application.
    pub fn n_blocks(&self) -> u64 {
        self.n_blocks
    }

    /// The state after the handshake.
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn into_state(self) -> State {
        self.state
    }

    /// Sync `app` with the block store and the state, and give it back.
    pub fn handshake(&mut self, mut app: Box<dyn AppConn>) -> Result<Box<dyn AppConn>, HandshakeError> {
        let info = app.info()?;
        log::info!(
            "ABCI handshake. app height: {}, app hash: {}",
            info.last_block_height,
            info.last_block_app_hash
        );

        let (app, app_hash) =
            self.replay_blocks(app, info.last_block_app_hash, info.last_block_height)?;

        log::info!(
            "Completed ABCI handshake, node and app are synced. app height: {}, app hash: {}",
            self.state.last_block_height,
            app_hash
        );
        Ok(app)
    }

    fn init_chain(&mut self, app: &mut dyn AppConn) -> Result<(), HandshakeError> {
        let validators = self
            .genesis
            .validators
            .iter()
            .map(|validator| ValidatorUpdate::new(validator.pub_key, validator.power))
            .collect();
        let response = app.init_chain(InitChainRequest {
            time: self.genesis.genesis_time,
            chain_id: self.genesis.chain_id.clone(),
            consensus_params: self.genesis.consensus_params,
            validators,
            app_state: self.genesis.app_state.clone(),
        })?;

        // Only a state that has not advanced past genesis takes the application's choices.
        if self.state.last_block_height != Height::new(0) {
            return Ok(());
        }
        if !response.validators.is_empty() {
            let validators = ValidatorSet::new(
                response
                    .validators
                    .iter()
                    .map(|update| Validator::new(update.pub_key, update.power))
                    .collect(),
            )?;
            self.state.next_validators = validators.copy_increment_proposer_priority(1);
            self.state.validators = validators;
        } else if self.genesis.validators.is_empty() {
            return Err(HandshakeError::EmptyValidatorSet);
        }
        if let Some(consensus_params) = response.consensus_params {
            self.state.consensus_params = consensus_params;
        }
        self.state_store.save_state(&self.state)?;
        Ok(())
    }

    fn replay_blocks(
        &mut self,
        mut app: Box<dyn AppConn>,
        app_hash: AppHash,
        app_height: Height,
    ) -> Result<(Box<dyn AppConn>, AppHash), HandshakeError> {
        let store_height = self.block_store.height();
        let state_height = self.state.last_block_height;
        log::info!(
            "ABCI replay blocks. app height: {}, store height: {}, state height: {}",
            app_height,
            store_height,
            state_height
        );

        if app_height == Height::new(0) {
            self.init_chain(app.as_mut())?;
        }

        if store_height == Height::new(0) {
            self.assert_app_hash_equals_state(&app_hash)?;
            return Ok((app, app_hash));
        }
        if store_height < app_height {
            return Err(HandshakeError::AppBlockHeightTooHigh {
                store_height,
                app_height,
            });
        }
        if store_height < state_height || store_height > state_height.next() {
            return Err(HandshakeError::InconsistentHeights {
                store_height,
                state_height,
            });
        }

        if store_height == state_height {
            if app_height < store_height {
                // The state is already synced with the store: no need to apply blocks.
                let app_hash =
                    self.exec_commit_blocks(app.as_mut(), app_hash, app_height, store_height)?;
                self.assert_app_hash_equals_state(&app_hash)?;
                return Ok((app, app_hash));
            }
            self.assert_app_hash_equals_state(&app_hash)?;
            return Ok((app, app_hash));
        }

        // The block at store_height was saved, but the state after it was not.
        if app_height < state_height {
            let app_hash =
                self.exec_commit_blocks(app.as_mut(), app_hash, app_height, state_height)?;
            self.assert_app_hash_in_block(&app_hash, store_height)?;
            let app = self.replay_block(app, store_height)?;
            let app_hash = self.state.app_hash.clone();
            Ok((app, app_hash))
        } else if app_height == state_height {
            log::info!("Replay last block using real app");
            let app = self.replay_block(app, store_height)?;
            let app_hash = self.state.app_hash.clone();
            Ok((app, app_hash))
        } else {
            log::info!("Replay last block using mock app");
            let abci_responses = self.state_store.load_abci_responses(store_height)?;
            let mock_app = MockApp::new(app_hash, abci_responses);
            self.replay_block(Box::new(mock_app), store_height)?;
            let app_hash = self.state.app_hash.clone();
            Ok((app, app_hash))
        }
    }

    /// Execute and commit the blocks `from+1..=to` against `app` without touching the state, checking
    /// that each block carries the app hash the previous one produced.
    fn exec_commit_blocks(
        &mut self,
        app: &mut dyn AppConn,
        mut app_hash: AppHash,
        from: Height,
        to: Height,
    ) -> Result<AppHash, HandshakeError> {
        let mut height = from.next();
        while height <= to {
            log::info!("Applying block. height: {}", height);
            if height > from.next() {
                self.assert_app_hash_in_block(&app_hash, height)?;
            }
            let block = self
                .block_store
                .load_block(height)?
                .ok_or(HandshakeError::MissingBlock { height })?;
            let last_validators = match height.prev() {
                Some(prev) if prev > Height::new(0) => self.state_store.load_validators(prev)?,
                _ => ValidatorSet::default(),
            };
            app_hash = exec_commit_block(app, &block, &last_validators)?;
            self.n_blocks += 1;
            height = height.next();
        }
        Ok(app_hash)
    }

    /// Apply the block at `height` to the state with `app`.
    fn replay_block(
        &mut self,
        app: Box<dyn AppConn>,
        height: Height,
    ) -> Result<Box<dyn AppConn>, HandshakeError> {
        let block = self
            .block_store
            .load_block(height)?
            .ok_or(HandshakeError::MissingBlock { height })?;
        let meta = self
            .block_store
            .load_block_meta(height)?
            .ok_or(HandshakeError::MissingBlock { height })?;

        let mut block_exec = BlockExecutor::new(
            self.state_store.clone(),
            app,
            Box::new(EmptyMempool),
            self.event_publisher.clone(),
        );
        self.state = block_exec.apply_block(&self.state, meta.block_id, &block)?;
        self.n_blocks += 1;
        Ok(block_exec.into_app())
    }

    fn assert_app_hash_equals_state(&self, app_hash: &AppHash) -> Result<(), HandshakeError> {
        if *app_hash != self.state.app_hash {
            return Err(HandshakeError::AppHashMismatch {
                height: self.state.last_block_height,
                expected: self.state.app_hash.clone(),
                actual: app_hash.clone(),
            });
        }
        Ok(())
    }

    fn assert_app_hash_in_block(
        &self,
        app_hash: &AppHash,
        height: Height,
    ) -> Result<(), HandshakeError> {
        let meta = self
            .block_store
            .load_block_meta(height)?
            .ok_or(HandshakeError::MissingBlock { height })?;
        if meta.header.app_hash != *app_hash {
            return Err(HandshakeError::AppHashMismatch {
                height,
                expected: meta.header.app_hash,
                actual: app_hash.clone(),
            });
        }
        Ok(())
    }
}

/// Stands in for an application that already committed a block: returns the results saved when the
/// block was first executed, and the app hash the application reported.
pub struct MockApp {
    app_hash: AppHash,
    abci_responses: ABCIResponses,
    tx_count: usize,
}

impl MockApp {
    pub fn new(app_hash: AppHash, abci_responses: ABCIResponses) -> MockApp {
        MockApp {
            app_hash,
            abci_responses,
            tx_count: 0,
        }
    }
}

impl AppConn for MockApp {
    fn info(&mut self) -> Result<InfoResponse, AppConnError> {
        Ok(InfoResponse::default())
    }

    fn init_chain(&mut self, _: InitChainRequest) -> Result<InitChainResponse, AppConnError> {
        Ok(InitChainResponse::default())
    }

    fn begin_block(&mut self, _: BeginBlockRequest) -> Result<(), AppConnError> {
        self.tx_count = 0;
        Ok(())
    }

    fn deliver_tx(&mut self, _: &Tx) -> Result<DeliverTxResponse, AppConnError> {
        let response = self
            .abci_responses
            .deliver_txs
            .get(self.tx_count)
            .cloned()
            .ok_or_else(|| {
                AppConnError::UnexpectedResponse(format!(
                    "no saved result for tx {}",
                    self.tx_count
                ))
            })?;
        self.tx_count += 1;
        Ok(response)
    }

    fn end_block(&mut self, _: EndBlockRequest) -> Result<EndBlockResponse, AppConnError> {
        Ok(self.abci_responses.end_block.clone())
    }

    fn commit(&mut self) -> Result<CommitResponse, AppConnError> {
        Ok(CommitResponse {
            data: self.app_hash.clone(),
        })
    }
}

#[derive(Debug)]
pub enum HandshakeError {
    App(AppConnError),
    StateStore(StateStoreError),
    BlockStore(BlockStoreError),
    BlockExecution(BlockExecutionError),
    InvalidValidators(ValidatorSetError),
    /// Neither the genesis file nor `init_chain` provided validators.
    EmptyValidatorSet,
    AppBlockHeightTooHigh {
        store_height: Height,
        app_height: Height,
    },
    InconsistentHeights {
        store_height: Height,
        state_height: Height,
    },
    MissingBlock {
        height: Height,
    },
    AppHashMismatch {
        height: Height,
        expected: AppHash,
        actual: AppHash,
    },
}

impl Display for HandshakeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::App(err) => write!(f, "application error: {:?}", err),
            HandshakeError::StateStore(err) => write!(f, "state store error: {:?}", err),
            HandshakeError::BlockStore(err) => write!(f, "block store error: {:?}", err),
            HandshakeError::BlockExecution(err) => write!(f, "error replaying block: {:?}", err),
            HandshakeError::InvalidValidators(err) => {
                write!(f, "invalid validators from init_chain: {:?}", err)
            }
            HandshakeError::EmptyValidatorSet => f.write_str(
                "validator set is empty in genesis and still empty after init_chain",
            ),
            HandshakeError::AppBlockHeightTooHigh {
                store_height,
                app_height,
            } => write!(
                f,
                "app block height {} is higher than block store height {}",
                app_height, store_height
            ),
            HandshakeError::InconsistentHeights {
                store_height,
                state_height,
            } => write!(
                f,
                "block store height {} is inconsistent with state height {}",
                store_height, state_height
            ),
            HandshakeError::MissingBlock { height } => {
                write!(f, "block {} missing from block store", height)
            }
            HandshakeError::AppHashMismatch {
                height,
                expected,
                actual,
            } => write!(
                f,
                "app hash mismatch at height {}: expected {}, got {}",
                height, expected, actual
            ),
        }
    }
}

impl From<AppConnError> for HandshakeError {
    fn from(value: AppConnError) -> Self {
        HandshakeError::App(value)
    }
}

impl From<StateStoreError> for HandshakeError {
    fn from(value: StateStoreError) -> Self {
        HandshakeError::StateStore(value)
    }
}

impl From<BlockStoreError> for HandshakeError {
    fn from(value: BlockStoreError) -> Self {
        HandshakeError::BlockStore(value)
    }
}

impl From<BlockExecutionError> for HandshakeError {
    fn from(value: BlockExecutionError) -> Self {
        HandshakeError::BlockExecution(value)
    }
}

impl From<ValidatorSetError> for HandshakeError {
    fn from(value: ValidatorSetError) -> Self {
        HandshakeError::InvalidValidators(value)
    }
}
