/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a node.
//!
//! A node brings together the pieces a consensus participant needs: the application, the mempool, the
//! network, a key-value store for the state and the blocks, the WAL, and (for validators) a signer. The
//! key components of this module are:
//! - The builder-pattern interface to construct a [specification of the node](NodeSpec),
//! - The function to [start](NodeSpec::start) a [Node] given its specification,
//! - [The type](Node) which keeps the node alive.
//!
//! ## Validators and full nodes
//!
//! A node built without a `.priv_validator(...)` follows consensus, applying every committed block, but
//! never votes or proposes.
//!
//! ## Starting a node
//!
//! ```ignore
//! let node =
//!     NodeSpec::builder()
//!     .app(app)
//!     .network(network)
//!     .kv_store(kv_store)
//!     .genesis(genesis)
//!     .config(consensus_config)
//!     .configuration(node_configuration)
//!     .priv_validator(LocalSigner::new(signing_key))
//!     .on_new_block(new_block_handler)
//!     .build()
//!     .start();
//! ```
//!
//! ### Required setters
//!
//! - `.app(...)`
//! - `.network(...)`
//! - `.kv_store(...)`
//! - `.genesis(...)`
//! - `.config(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! - `.priv_validator(...)`
//! - `.mempool(...)`: defaults to a mempool that is always empty.
//! - One `.on_*(...)` setter per event type in [crate::events], e.g. `.on_vote(...)`.
//!
//! ## Fatal errors
//!
//! Starting a node panics if the handshake with the application fails, if the WAL cannot be opened, or
//! if replaying the WAL hits a fatal error. These all mean that the node's stores are inconsistent with
//! each other, and need an operator's attention.

use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use typed_builder::TypedBuilder;

use crate::app::AppConn;
use crate::config::ConsensusConfig;
use crate::consensus::codec::MessageCodec;
use crate::consensus::reactor::{ConsensusReactor, PeerRoundState};
use crate::consensus::replay::Handshaker;
use crate::consensus::round_state::RoundStateSnapshot;
use crate::consensus::state::{ConsensusService, ConsensusState, ConsensusStateSpec};
use crate::event_bus::*;
use crate::events::*;
use crate::kv_store::KVStore;
use crate::mempool::{EmptyMempool, Mempool};
use crate::networking::{start_polling, ChannelID, Network};
use crate::service::Service;
use crate::state::{BlockExecutor, StateStore};
use crate::store::{BlockStore, KVBlockStore};
use crate::types::{basic::PeerID, genesis::GenesisDoc, signer::PrivValidator};
use crate::wal::BaseWAL;

/// Node-level parameters that are not part of the [ConsensusConfig].
///
/// ## Log Events
///
/// tendermint_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [NodeConfiguration].

    Optional:
    - `.log_events(...)`
    - `.max_msg_size(...)`
"))]
pub struct NodeConfiguration {
    #[builder(default = false, setter(doc = "Print a CSV log line for every event. Default: false."))]
    pub log_events: bool,
    #[builder(default = crate::consensus::codec::MAX_MSG_SIZE_BYTES, setter(doc = "Largest frame, in bytes, accepted from or sent to peers. Default: 1 MiB."))]
    pub max_msg_size: usize,
}

/// Stores all necessary parameters and trait implementations required to run a [Node].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [NodeSpec]. On the builder call the following methods to construct a valid [NodeSpec].

    Required:
    - `.app(...)`
    - `.network(...)`
    - `.kv_store(...)`
    - `.genesis(...)`
    - `.config(...)`
    - `.configuration(...)`

    Optional:
    - `.priv_validator(...)`
    - `.mempool(...)`
    - `.on_new_round_step(...)`
    - `.on_new_round(...)`
    - `.on_complete_proposal(...)`
    - `.on_new_valid_block(...)`
    - `.on_timeout_propose(...)`
    - `.on_timeout_wait(...)`
    - `.on_vote(...)`
    - `.on_polka(...)`
    - `.on_lock(...)`
    - `.on_unlock(...)`
    - `.on_relock(...)`
    - `.on_conflicting_votes(...)`
    - `.on_new_block(...)`
    - `.on_new_block_header(...)`
    - `.on_validator_set_updates(...)`
"))]
pub struct NodeSpec<K: KVStore, N: Network + 'static> {
    // Required parameters
    #[builder(setter(transform = |app: impl AppConn + 'static| Box::new(app) as Box<dyn AppConn>,
    doc = "Set the connection to the application. The argument must implement the [AppConn](crate::app::AppConn) trait. Required."))]
    app: Box<dyn AppConn>,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the implementation of the node's Key-Value store, which holds both the state and the blocks. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the genesis document of the chain. Required."))]
    genesis: GenesisDoc,
    #[builder(setter(doc = "Set the [consensus configuration](ConsensusConfig). Required."))]
    config: ConsensusConfig,
    #[builder(setter(doc = "Set the [node configuration](NodeConfiguration). Required."))]
    configuration: NodeConfiguration,
    // Optional parameters
    #[builder(default, setter(transform = |priv_validator: impl PrivValidator + 'static| Some(Box::new(priv_validator) as Box<dyn PrivValidator>),
    doc = "Set the signer of this validator's votes and proposals. Without one, the node does not vote. Optional."))]
    priv_validator: Option<Box<dyn PrivValidator>>,
    #[builder(default = Box::new(EmptyMempool), setter(transform = |mempool: impl Mempool + 'static| Box::new(mempool) as Box<dyn Mempool>,
    doc = "Set the mempool that proposals are reaped from. Optional."))]
    mempool: Box<dyn Mempool>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewRoundStepEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewRoundStepEvent>),
    doc = "Register a handler closure to be invoked after the node moves to a new step. Optional."))]
    on_new_round_step: Option<HandlerPtr<NewRoundStepEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewRoundEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewRoundEvent>),
    doc = "Register a handler closure to be invoked after the node enters a new round. Optional."))]
    on_new_round: Option<HandlerPtr<NewRoundEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CompleteProposalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CompleteProposalEvent>),
    doc = "Register a handler closure to be invoked after the node receives a proposal and all of its block parts. Optional."))]
    on_complete_proposal: Option<HandlerPtr<CompleteProposalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewValidBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewValidBlockEvent>),
    doc = "Register a handler closure to be invoked after the node sees a polka for a block it is collecting the parts of. Optional."))]
    on_new_valid_block: Option<HandlerPtr<NewValidBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TimeoutProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TimeoutProposeEvent>),
    doc = "Register a handler closure to be invoked after the propose timeout of a round fires. Optional."))]
    on_timeout_propose: Option<HandlerPtr<TimeoutProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TimeoutWaitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TimeoutWaitEvent>),
    doc = "Register a handler closure to be invoked after the prevote-wait or precommit-wait timeout of a round fires. Optional."))]
    on_timeout_wait: Option<HandlerPtr<TimeoutWaitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&VoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<VoteEvent>),
    doc = "Register a handler closure to be invoked after a vote is added to the node's vote sets. Optional."))]
    on_vote: Option<HandlerPtr<VoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PolkaEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PolkaEvent>),
    doc = "Register a handler closure to be invoked after the node sees +2/3 prevotes for a block or nil while precommitting. Optional."))]
    on_polka: Option<HandlerPtr<PolkaEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&LockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<LockEvent>),
    doc = "Register a handler closure to be invoked after the node locks on a block. Optional."))]
    on_lock: Option<HandlerPtr<LockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UnlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UnlockEvent>),
    doc = "Register a handler closure to be invoked after the node releases its lock. Optional."))]
    on_unlock: Option<HandlerPtr<UnlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RelockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RelockEvent>),
    doc = "Register a handler closure to be invoked after the node sees a new polka for the block it is locked on. Optional."))]
    on_relock: Option<HandlerPtr<RelockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ConflictingVotesEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ConflictingVotesEvent>),
    doc = "Register a handler closure to be invoked after the node receives two different votes from the same validator for the same round and step. Optional."))]
    on_conflicting_votes: Option<HandlerPtr<ConflictingVotesEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is committed and applied. Optional."))]
    on_new_block: Option<HandlerPtr<NewBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewBlockHeaderEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewBlockHeaderEvent>),
    doc = "Register a handler closure to be invoked with the header of every committed block. Optional."))]
    on_new_block_header: Option<HandlerPtr<NewBlockHeaderEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ValidatorSetUpdatesEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ValidatorSetUpdatesEvent>),
    doc = "Register a handler closure to be invoked after a committed block updates the validator set. Optional."))]
    on_validator_set_updates: Option<HandlerPtr<ValidatorSetUpdatesEvent>>,
}

impl<K: KVStore, N: Network + 'static> NodeSpec<K, N> {

    /// Syncs the application with the stores, replays the WAL, and starts all threads and channels
    /// associated with running a node. Returns the handles to them in a [Node] struct.
    pub fn start(self) -> Node<K, N> {
        let log_events = self.configuration.log_events;
        let codec = MessageCodec::new(self.configuration.max_msg_size);

        let event_handlers = EventHandlers::new(
            log_events,
            UserHandlers {
                on_new_round_step: self.on_new_round_step,
                on_new_round: self.on_new_round,
                on_complete_proposal: self.on_complete_proposal,
                on_new_valid_block: self.on_new_valid_block,
                on_timeout_propose: self.on_timeout_propose,
                on_timeout_wait: self.on_timeout_wait,
                on_vote: self.on_vote,
                on_polka: self.on_polka,
                on_lock: self.on_lock,
                on_unlock: self.on_unlock,
                on_relock: self.on_relock,
                on_conflicting_votes: self.on_conflicting_votes,
                on_new_block: self.on_new_block,
                on_new_block_header: self.on_new_block_header,
                on_validator_set_updates: self.on_validator_set_updates,
            },
        );

        let (event_publisher, event_subscriber) =
            if !event_handlers.is_empty() {
                Some(mpsc::channel()).unzip()
            } else { (None, None) };

        let mut state_store = StateStore::new(self.kv_store.clone());
        let state = state_store
            .load_state_from_db_or_genesis(&self.genesis)
            .unwrap_or_else(|err| panic!("Failed to load state: {:?}", err));
        let block_store: Box<dyn BlockStore> = Box::new(
            KVBlockStore::new(self.kv_store.clone())
                .unwrap_or_else(|err| panic!("Failed to open block store: {:?}", err)),
        );

        let (state, app) = {
            let mut handshaker = Handshaker::new(
                state_store.clone(),
                state,
                block_store.as_ref(),
                &self.genesis,
                event_publisher.clone(),
            );
            let app = handshaker
                .handshake(self.app)
                .unwrap_or_else(|err| panic!("Error during handshake: {}", err));
            (handshaker.into_state(), app)
        };

        let wal = BaseWAL::open(&self.config.wal_path)
            .unwrap_or_else(|err| panic!("Failed to open WAL at {:?}: {:?}", self.config.wal_path, err));

        let block_exec = BlockExecutor::new(state_store, app, self.mempool, event_publisher.clone());

        let spec = ConsensusStateSpec::builder()
            .config(self.config)
            .state(state)
            .block_exec(block_exec)
            .block_store(block_store)
            .network(self.network.clone())
            .codec(codec)
            .wal(Box::new(wal))
            .event_publisher(event_publisher)
            .build();
        let mut engine = ConsensusState::new(spec)
            .unwrap_or_else(|err| panic!("Failed to build consensus engine: {}", err));
        if let Some(priv_validator) = self.priv_validator {
            engine.set_priv_validator(priv_validator);
        }

        let reactor = ConsensusReactor::new(codec, engine.input_sender());
        let mut consensus = ConsensusService::new(engine);

        let (event_bus_shutdown, event_bus_shutdown_receiver) =
            if !event_handlers.is_empty() {
                Some(mpsc::channel()).unzip()
            } else { (None, None) };

        let event_bus = match (event_subscriber, event_bus_shutdown_receiver) {
            (Some(event_subscriber), Some(event_bus_shutdown_receiver)) => Some(start_event_bus(
                event_handlers,
                event_subscriber,
                event_bus_shutdown_receiver,
            )),
            _ => None,
        };

        consensus
            .start()
            .unwrap_or_else(|err| panic!("Failed to start consensus: {}", err));

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller = start_polling(self.network, reactor.clone(), poller_shutdown_receiver);

        Node {
            reactor,
            consensus,
            poller: Some(poller),
            poller_shutdown,
            event_bus,
            event_bus_shutdown,
        }
    }
}

/// A handle to the background threads of a node. When this value is dropped, all background threads
/// are gracefully shut down.
pub struct Node<K: KVStore, N: Network + 'static> {
    reactor: ConsensusReactor,
    consensus: ConsensusService<K, N>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<K: KVStore, N: Network + 'static> Node<K, N> {
    /// A copy of the engine's round state as of the last input it processed.
    pub fn round_state(&self) -> Option<RoundStateSnapshot> {
        self.consensus.round_state()
    }

    /// What `peer` has told this node about its own round state.
    pub fn peer_state(&self, peer: &PeerID) -> Option<PeerRoundState> {
        self.reactor.peer_state(peer)
    }

    /// Hand a frame to the reactor directly, bypassing the [Network]'s `recv`.
    pub fn receive(&mut self, channel: ChannelID, peer: PeerID, bytes: &[u8]) {
        self.reactor.receive(channel, peer, bytes)
    }

    /// Returns false once the engine thread has exited, e.g. on a fatal error.
    pub fn is_running(&self) -> bool {
        self.consensus.is_running()
    }
}

impl<K: KVStore, N: Network + 'static> Drop for Node<K, N> {
    fn drop(&mut self) {
        // The engine publishes events and receives frames from the poller, so it is stopped after the
        // event bus and before the poller.

        self.event_bus_shutdown.iter().for_each(|shutdown| {
            if shutdown.send(()).is_err() {
                log::debug!("Event bus thread already exited");
            }
        });
        if let Some(event_bus) = self.event_bus.take() {
            if event_bus.join().is_err() {
                log::error!("Event bus thread panicked");
            }
        }

        if let Err(err) = self.consensus.stop() {
            log::error!("Consensus engine stopped with an error: {}", err);
        }

        if self.poller_shutdown.send(()).is_err() {
            log::debug!("Poller thread already exited");
        }
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                log::error!("Poller thread panicked");
            }
        }
    }
}
