/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The round engine: the [ConsensusState], which owns the [RoundState] and drives it through the steps
//! of each round, and the [ConsensusService], which runs it on a thread of its own.
//!
//! ## Receive loop
//!
//! Everything that can change the round state is funneled into a single queue of [ConsensusInput]s:
//! messages forwarded by the [reactor](super::reactor::ConsensusReactor), timeouts fired by the
//! [ticker](super::ticker::TimeoutTicker), and mempool notifications. Messages the engine generates
//! itself (its proposal, the proposal's block parts, and its votes) go into an internal queue that is
//! drained after every input, before the next input is taken.
//!
//! ## WAL discipline
//!
//! Every input that can cause a state transition is written to the [WAL] *before* it is acted upon.
//! Peer messages and timeouts are written without syncing; the engine's own messages are synced, so that
//! after a crash the node never signs a message that conflicts with one it already sent. When a block is
//! committed, the marker of the next height is written (synced) before the block is applied. On
//! [start](ConsensusState::start), the messages written after the marker of the current height are
//! [replayed](ConsensusState::catchup_replay) through the same handlers the live loop uses.
//!
//! ## Locking
//!
//! A validator only precommits a block if it is locked on it, or has just seen a +2/3 prevote majority
//! (a "polka") for it in the current round, in which case it locks on it. It unlocks when it sees a polka
//! for nil, or a polka for a different block in a round later than the one it locked in.

use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::mem;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use borsh::BorshDeserialize;
use typed_builder::TypedBuilder;

use crate::config::ConsensusConfig;
use crate::events::*;
use crate::kv_store::KVStore;
use crate::mempool::TxsAvailableNotifier;
use crate::networking::Network;
use crate::service::{Service, ServiceError};
use crate::state::{BlockExecutionError, BlockExecutor, InvalidBlockError, State};
use crate::store::{BlockStore, BlockStoreError};
use crate::types::{
    basic::{CryptoHash, Height, PeerID, Round, Step, Timestamp},
    bit_array::BitArray,
    block::{Block, BlockID, Commit},
    part_set::{PartSet, PartSetError, BLOCK_PART_SIZE_BYTES},
    proposal::{Proposal, ProposalError},
    signer::{PrivValidator, SignerError},
    vote::{Vote, VoteType},
    vote_set::{VoteSet, VoteSetError},
};
use crate::wal::{MetaMessage, NopWAL, WALEntry, WALError, WALMessage, WALSearchOptions, WAL};

use super::codec::MessageCodec;
use super::messages::*;
use super::reactor::Broadcaster;
use super::round_state::{RoundState, RoundStateSnapshot};
use super::ticker::{TimeoutScheduler, TimeoutTicker};

/// Capacity of the engine's input queue.
pub const INPUT_QUEUE_CAPACITY: usize = 1000;

/// Maximum number of messages for the next height held back until the engine reaches that height.
pub const MAX_FUTURE_HEIGHT_MSGS: usize = 1000;

/// How often the receive loop checks for the shutdown signal while the input queue is empty.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed to build a [ConsensusState].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ConsensusStateSpec].

    Required:
    - `.config(...)`
    - `.state(...)`
    - `.block_exec(...)`
    - `.block_store(...)`

    Optional:
    - `.priv_validator(...)`: without one, the node follows consensus without voting.
    - `.network(...)`: without one, the engine broadcasts nothing.
    - `.codec(...)`
    - `.wal(...)`: defaults to a [NopWAL].
    - `.ticker(...)`: defaults to a [TimeoutTicker] feeding the engine's own queue.
    - `.event_publisher(...)`
"))]
pub struct ConsensusStateSpec<K: KVStore, N: Network> {
    config: ConsensusConfig,
    state: State,
    block_exec: BlockExecutor<K>,
    block_store: Box<dyn BlockStore>,
    #[builder(default, setter(strip_option))]
    priv_validator: Option<Box<dyn PrivValidator>>,
    #[builder(default, setter(strip_option))]
    network: Option<N>,
    #[builder(default)]
    codec: MessageCodec,
    #[builder(default = Box::new(NopWAL))]
    wal: Box<dyn WAL>,
    #[builder(default, setter(strip_option))]
    ticker: Option<Box<dyn TimeoutScheduler>>,
    #[builder(default)]
    event_publisher: Option<Sender<Event>>,
}

pub struct ConsensusState<K: KVStore, N: Network> {
    config: ConsensusConfig,
    state: State,
    block_exec: BlockExecutor<K>,
    block_store: Box<dyn BlockStore>,
    priv_validator: Option<Box<dyn PrivValidator>>,
    wal: Box<dyn WAL>,
    ticker: Box<dyn TimeoutScheduler>,
    broadcaster: Option<Broadcaster<N>>,

    rs: RoundState,
    snapshot: Arc<Mutex<RoundStateSnapshot>>,

    internal_queue: VecDeque<MsgInfo>,
    // Peer messages for the next height, re-processed once the engine gets there.
    future_height_msgs: VecDeque<MsgInfo>,
    pending_inputs: VecDeque<ConsensusInput>,
    input_sender: SyncSender<ConsensusInput>,
    input_receiver: Receiver<ConsensusInput>,

    event_publisher: Option<Sender<Event>>,
    replay_mode: bool,
    started: bool,
}

impl<K: KVStore, N: Network> ConsensusState<K, N> {
    /// Build the engine at the height following `spec.state`, with the last commit reconstructed from
    /// the block store.
    pub fn new(spec: ConsensusStateSpec<K, N>) -> Result<ConsensusState<K, N>, ConsensusError> {
        let ConsensusStateSpec {
            config,
            state,
            mut block_exec,
            block_store,
            priv_validator,
            network,
            codec,
            wal,
            ticker,
            event_publisher,
        } = spec;

        let (input_sender, input_receiver) = mpsc::sync_channel(INPUT_QUEUE_CAPACITY);
        let ticker =
            ticker.unwrap_or_else(|| Box::new(TimeoutTicker::new(input_sender.clone())));
        if config.wait_for_txs() {
            block_exec
                .mempool()
                .enable_txs_available(TxsAvailableNotifier::new(input_sender.clone()));
        }

        let rs = RoundState::new(
            state.chain_id.clone(),
            state.last_block_height.next(),
            state.validators.clone(),
        );
        let snapshot = Arc::new(Mutex::new(rs.snapshot()));

        let mut cs = ConsensusState {
            config,
            state: state.clone(),
            block_exec,
            block_store,
            priv_validator,
            wal,
            ticker,
            broadcaster: network.map(|network| Broadcaster::new(network, codec)),
            rs,
            snapshot,
            internal_queue: VecDeque::new(),
            future_height_msgs: VecDeque::new(),
            pending_inputs: VecDeque::new(),
            input_sender,
            input_receiver,
            event_publisher,
            replay_mode: false,
            started: false,
        };
        cs.reset_to_state(state)?;
        cs.reconstruct_last_commit()?;
        cs.publish_snapshot();
        Ok(cs)
    }

    /// A sender into the engine's input queue, for the reactor and the mempool.
    pub fn input_sender(&self) -> SyncSender<ConsensusInput> {
        self.input_sender.clone()
    }

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    /// A handle to the snapshot of the round state, republished after every input.
    pub fn round_state_snapshot(&self) -> Arc<Mutex<RoundStateSnapshot>> {
        self.snapshot.clone()
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Replace the signer. Takes effect from the next vote or proposal.
    pub fn set_priv_validator(&mut self, priv_validator: Box<dyn PrivValidator>) {
        self.priv_validator = Some(priv_validator);
    }

    /// Start the WAL and the ticker, catch up with the messages in the WAL for the current height, and
    /// schedule the first round.
    pub fn start(&mut self) -> Result<(), ConsensusError> {
        if self.started {
            return Err(ConsensusError::Service(ServiceError::AlreadyStarted));
        }
        self.wal.start()?;
        self.ticker.start()?;

        let height = self.rs.height;
        let options = WALSearchOptions {
            ignore_data_corruption_errors: true,
            ..Default::default()
        };
        if self.wal.search_for_height(height, &options)?.is_none()
            && self.wal.search_for_height(height.next(), &options)?.is_none()
        {
            self.wal.write_meta_sync(MetaMessage { height })?;
        }
        self.started = true;

        match self.catchup_replay(height) {
            Ok(()) => (),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => log::error!(
                "Error on catchup replay, proceeding to start anyway: {}",
                err
            ),
        }
        self.discard_replayed_internal_msgs();

        self.schedule_round0();
        self.drain_queues()?;
        self.publish_snapshot();
        Ok(())
    }

    /// Stop the ticker, and flush and close the WAL.
    pub fn stop(&mut self) -> Result<(), ConsensusError> {
        if !self.started {
            return Err(ConsensusError::Service(ServiceError::NotStarted));
        }
        self.started = false;
        let ticker_result = self.ticker.stop();
        self.wal.stop()?;
        ticker_result?;
        Ok(())
    }

    /// Handle a single input, and everything it causes the engine to generate.
    pub fn process(&mut self, input: ConsensusInput) -> Result<(), ConsensusError> {
        self.handle_input(input)?;
        self.drain_queues()?;
        self.publish_snapshot();
        Ok(())
    }

    /// Process the inputs currently in the input queue, without waiting for more. Returns how many
    /// were processed.
    pub fn process_available(&mut self) -> Result<usize, ConsensusError> {
        let mut processed = 0;
        while let Ok(input) = self.input_receiver.try_recv() {
            self.process(input)?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Process inputs until `shutdown` fires, or a fatal error occurs.
    pub fn run(&mut self, shutdown: Receiver<()>) -> Result<(), ConsensusError> {
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return Ok(()),
                Err(TryRecvError::Empty) => (),
            }

            match self.input_receiver.recv_timeout(SHUTDOWN_POLL_INTERVAL) {
                Ok(input) => self.process(input)?,
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Replay the messages written to the WAL after the marker of `height`.
    pub fn catchup_replay(&mut self, height: Height) -> Result<(), ConsensusError> {
        self.replay_mode = true;
        let result = self.replay_height(height);
        self.replay_mode = false;
        result
    }

    fn replay_height(&mut self, height: Height) -> Result<(), ConsensusError> {
        let options = WALSearchOptions {
            ignore_data_corruption_errors: true,
            ..Default::default()
        };
        if self
            .wal
            .search_for_height(height.next(), &options)?
            .is_some()
        {
            return Err(ConsensusError::WALContainsEndHeight { height });
        }
        let mut reader = self
            .wal
            .search_for_height(height, &options)?
            .ok_or(ConsensusError::WALMissingHeight { height })?;

        log::info!("Catchup by replaying consensus messages. height: {}", height);
        loop {
            match reader.decode() {
                Ok(Some(entry)) => self.read_replay_message(entry)?,
                Ok(None) => break,
                Err(err) => {
                    if err.is_data_corruption() {
                        log::error!(
                            "Data has been corrupted in last height of consensus WAL. height: {}, err: {:?}",
                            height,
                            err
                        );
                    }
                    return Err(err.into());
                }
            }
        }
        log::info!("Replay: done");
        Ok(())
    }

    fn read_replay_message(&mut self, entry: WALEntry) -> Result<(), ConsensusError> {
        let timed = match entry {
            WALEntry::Meta(_) => return Ok(()),
            WALEntry::Timed(timed) => timed,
        };
        match timed.msg {
            WALMessage::RoundStep(hrs) => {
                log::info!("Replay: new step {}", hrs);
                Ok(())
            }
            WALMessage::MsgInfo(msg_info) => {
                let peer = msg_info
                    .peer
                    .as_ref()
                    .map_or(String::from("local"), |peer| peer.to_string());
                log::info!("Replay: {} from {}", msg_info.msg.name(), peer);
                self.handle_msg(msg_info)
            }
            WALMessage::Timeout(timeout_info) => {
                log::info!(
                    "Replay: timeout {}/{}/{} after {}ms",
                    timeout_info.height,
                    timeout_info.round,
                    timeout_info.step,
                    timeout_info.duration_ms
                );
                let result = self.handle_timeout(timeout_info);
                self.log_soft_error(result, "ticker")
            }
        }
    }

    /// Drop the internal messages generated while replaying that the WAL already had versions of.
    fn discard_replayed_internal_msgs(&mut self) {
        let queue = mem::take(&mut self.internal_queue);
        for msg_info in queue {
            let replayed = match &msg_info.msg {
                ConsensusMessage::Proposal(msg) => {
                    self.rs.proposal.is_some()
                        || (msg.proposal.height, msg.proposal.round) != (self.rs.height, self.rs.round)
                }
                ConsensusMessage::BlockPart(msg) => {
                    msg.height != self.rs.height
                        || self
                            .rs
                            .proposal_block_parts
                            .as_ref()
                            .map_or(true, |parts| parts.get_part(msg.part.index as usize).is_some())
                }
                ConsensusMessage::Vote(msg) => {
                    msg.vote.height != self.rs.height
                        || self
                            .rs
                            .votes
                            .vote_set(msg.vote.round, msg.vote.vote_type)
                            .map_or(false, |vote_set| {
                                vote_set
                                    .get_by_index(msg.vote.validator_index as usize)
                                    .is_some()
                            })
                }
                _ => false,
            };
            if replayed {
                log::debug!("Discarding {} re-generated during replay", msg_info.msg.name());
            } else {
                self.internal_queue.push_back(msg_info);
            }
        }
    }

    /* ↓↓↓ Receive loop ↓↓↓ */

    fn handle_input(&mut self, input: ConsensusInput) -> Result<(), ConsensusError> {
        match input {
            ConsensusInput::Message(msg_info) => {
                if self.stash_if_future_height(&msg_info) {
                    return Ok(());
                }
                if drives_state_machine(&msg_info.msg) {
                    self.wal.write(WALMessage::MsgInfo(msg_info.clone()))?;
                }
                self.handle_msg(msg_info)
            }
            ConsensusInput::Timeout(timeout_info) => {
                self.wal.write(WALMessage::Timeout(timeout_info.clone()))?;
                let result = self.handle_timeout(timeout_info);
                self.log_soft_error(result, "ticker")
            }
            ConsensusInput::TxsAvailable => {
                let result = self.handle_txs_available();
                self.log_soft_error(result, "mempool")
            }
        }
    }

    fn stash_if_future_height(&mut self, msg_info: &MsgInfo) -> bool {
        if msg_info.peer.is_none() || msg_height(&msg_info.msg) != Some(self.rs.height.next()) {
            return false;
        }
        if self.future_height_msgs.len() >= MAX_FUTURE_HEIGHT_MSGS {
            log::debug!("Dropping {} for next height: stash full", msg_info.msg.name());
        } else {
            self.future_height_msgs.push_back(msg_info.clone());
        }
        true
    }

    fn drain_queues(&mut self) -> Result<(), ConsensusError> {
        loop {
            if let Some(msg_info) = self.internal_queue.pop_front() {
                self.wal.write_sync(WALMessage::MsgInfo(msg_info.clone()))?;
                let msg = msg_info.msg.clone();
                self.handle_msg(msg_info)?;
                self.broadcast(&msg);
            } else if let Some(input) = self.pending_inputs.pop_front() {
                self.handle_input(input)?;
            } else {
                return Ok(());
            }
        }
    }

    fn handle_msg(&mut self, msg_info: MsgInfo) -> Result<(), ConsensusError> {
        let MsgInfo { msg, peer } = msg_info;
        let result = match msg {
            ConsensusMessage::Proposal(msg) => self.set_proposal(msg.proposal),
            ConsensusMessage::BlockPart(msg) => {
                let round = msg.round;
                match self.add_proposal_block_part(msg) {
                    // Parts of a block from another round are only nice to have.
                    Err(err) if !err.is_fatal() && round != self.rs.round => {
                        log::debug!("Ignoring block part from round {}: {}", round, err);
                        Ok(())
                    }
                    result => result.map(|_| ()),
                }
            }
            ConsensusMessage::Vote(msg) => self.try_add_vote(msg.vote, peer.as_ref()),
            ConsensusMessage::VoteSetMaj23(msg) => match &peer {
                Some(peer) => self.handle_vote_set_maj23(msg, peer.clone()),
                None => Ok(()),
            },
            other => {
                log::debug!("Unexpected {} in consensus receive loop", other.name());
                Ok(())
            }
        };

        self.log_soft_error(result, &peer_name(&peer))
    }

    /// Log a soft error instead of passing it up. Fatal errors pass through.
    fn log_soft_error(
        &self,
        result: Result<(), ConsensusError>,
        source: &str,
    ) -> Result<(), ConsensusError> {
        match result {
            Err(err) if !err.is_fatal() => {
                log::warn!(
                    "Error handling input. height: {}, round: {}, from: {}, err: {}",
                    self.rs.height,
                    self.rs.round,
                    source,
                    err
                );
                Ok(())
            }
            result => result,
        }
    }

    fn handle_timeout(&mut self, timeout_info: TimeoutInfo) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if timeout_info.height != rs.height
            || timeout_info.round < rs.round
            || (timeout_info.round == rs.round && timeout_info.step < rs.step)
        {
            log::debug!(
                "Ignoring timeout for {}/{}/{}: already at {}",
                timeout_info.height,
                timeout_info.round,
                timeout_info.step,
                rs.hrs()
            );
            return Ok(());
        }

        let (height, round) = (timeout_info.height, timeout_info.round);
        match timeout_info.step {
            Step::NewHeight => self.enter_new_round(height, Round::new(0)),
            Step::NewRound => self.enter_propose(height, Round::new(0)),
            Step::Propose => {
                self.publish_event(Event::TimeoutPropose(TimeoutProposeEvent {
                    timestamp: SystemTime::now(),
                    height: self.rs.height,
                    round: self.rs.round,
                    step: self.rs.step,
                }));
                self.enter_prevote(height, round)
            }
            Step::PrevoteWait => {
                self.publish_timeout_wait();
                self.enter_precommit(height, round)
            }
            Step::PrecommitWait => {
                self.publish_timeout_wait();
                self.enter_precommit(height, round)?;
                self.enter_new_round(height, round.next())
            }
            step => {
                log::error!("Invalid timeout step: {}", step);
                Ok(())
            }
        }
    }

    fn handle_txs_available(&mut self) -> Result<(), ConsensusError> {
        if self.rs.round != Round::new(0) {
            return Ok(());
        }
        match self.rs.step {
            Step::NewHeight => {
                if self.need_proof_block(self.rs.height)? {
                    // enter_new_round will propose right away.
                    return Ok(());
                }
                // Lands just after the NewHeight timeout.
                let timeout_commit = self.rs.start_time.saturating_since(Timestamp::now())
                    + Duration::from_millis(1);
                self.schedule_timeout(timeout_commit, self.rs.height, Round::new(0), Step::NewRound);
                Ok(())
            }
            Step::NewRound => self.enter_propose(self.rs.height, Round::new(0)),
            _ => Ok(()),
        }
    }

    fn handle_vote_set_maj23(
        &mut self,
        msg: VoteSetMaj23Message,
        peer: PeerID,
    ) -> Result<(), ConsensusError> {
        if msg.height != self.rs.height {
            return Ok(());
        }
        self.rs
            .votes
            .set_peer_maj23(msg.round, msg.vote_type, peer.clone(), msg.block_id)?;

        let votes = self
            .rs
            .votes
            .vote_set(msg.round, msg.vote_type)
            .and_then(|vote_set| vote_set.bit_array_by_block_id(&msg.block_id))
            .unwrap_or_else(|| BitArray::new(self.rs.validators.len()));
        let response = ConsensusMessage::VoteSetBits(VoteSetBitsMessage {
            height: msg.height,
            round: msg.round,
            vote_type: msg.vote_type,
            block_id: msg.block_id,
            votes,
        });
        if !self.replay_mode {
            if let Some(broadcaster) = &mut self.broadcaster {
                broadcaster.send(peer, &response);
            }
        }
        Ok(())
    }

    /* ↓↓↓ State transitions ↓↓↓ */

    fn update_round_step(&mut self, round: Round, step: Step) {
        self.rs.round = round;
        self.rs.step = step;
    }

    /// Record the new step in the WAL, and tell event handlers and peers about it.
    fn new_step(&mut self) -> Result<(), ConsensusError> {
        let hrs = self.rs.hrs();
        if self.started && !self.replay_mode {
            self.wal.write(WALMessage::RoundStep(hrs))?;
        }
        self.publish_event(Event::NewRoundStep(NewRoundStepEvent {
            timestamp: SystemTime::now(),
            height: hrs.height,
            round: hrs.round,
            step: hrs.step,
        }));
        let msg = ConsensusMessage::NewRoundStep(NewRoundStepMessage {
            height: hrs.height,
            round: hrs.round,
            step: hrs.step,
            seconds_since_start_time: Timestamp::now()
                .saturating_since(self.rs.start_time)
                .as_secs(),
            last_commit_round: self.rs.last_commit_round(),
        });
        self.broadcast(&msg);
        Ok(())
    }

    /// Move to the height following `state`, unless the engine is already there.
    fn update_to_state(&mut self, state: State) -> Result<(), ConsensusError> {
        if self.rs.commit_round.is_some() && self.rs.height != state.last_block_height {
            return Err(ConsensusError::StateHeightMismatch {
                expected: self.rs.height,
                actual: state.last_block_height,
            });
        }
        if state.last_block_height <= self.state.last_block_height {
            log::info!(
                "Ignoring update to state at height {}: already at height {}",
                state.last_block_height,
                self.state.last_block_height
            );
            return self.new_step();
        }
        self.reset_to_state(state)
    }

    fn reset_to_state(&mut self, state: State) -> Result<(), ConsensusError> {
        let last_commit = match self.rs.commit_round {
            Some(commit_round) => {
                let precommits = self
                    .rs
                    .votes
                    .precommits(commit_round)
                    .filter(|precommits| precommits.has_two_thirds_majority())
                    .ok_or(ConsensusError::MissingCommitMajority {
                        height: self.rs.height,
                    })?;
                Some(precommits.clone())
            }
            None => None,
        };

        let height = state.last_block_height.next();
        let start_time = match self.rs.commit_time {
            Some(commit_time) => commit_time.plus(self.config.commit()),
            None => Timestamp::now().plus(self.config.commit()),
        };

        let mut rs = RoundState::new(state.chain_id.clone(), height, state.validators.clone());
        rs.start_time = start_time;
        rs.last_commit = last_commit;
        rs.last_validators = state.last_validators.clone();
        self.rs = rs;
        self.state = state;

        self.new_step()
    }

    /// Rebuild the precommits of the last block from the seen commit in the block store.
    fn reconstruct_last_commit(&mut self) -> Result<(), ConsensusError> {
        let height = self.state.last_block_height;
        if height == Height::new(0) {
            return Ok(());
        }
        let seen_commit = self
            .block_store
            .load_seen_commit(height)?
            .ok_or(ConsensusError::MissingSeenCommit { height })?;
        let last_precommits = VoteSet::from_commit(
            self.state.chain_id.clone(),
            &seen_commit,
            self.state.last_validators.clone(),
        )
        .map_err(ConsensusError::InvalidSeenCommit)?;
        if !last_precommits.has_two_thirds_majority() {
            return Err(ConsensusError::MissingCommitMajority { height });
        }
        self.rs.last_commit = Some(last_precommits);
        Ok(())
    }

    fn schedule_round0(&mut self) {
        let sleep = self.rs.start_time.saturating_since(Timestamp::now());
        self.schedule_timeout(sleep, self.rs.height, Round::new(0), Step::NewHeight);
    }

    fn schedule_timeout(&mut self, duration: Duration, height: Height, round: Round, step: Step) {
        self.ticker.schedule_timeout(TimeoutInfo {
            duration_ms: duration.as_millis() as u64,
            height,
            round,
            step,
        });
    }

    /// Enter a new round, choosing its proposer. Also called to skip ahead to a round in which +2/3 of
    /// the voting power has already voted.
    fn enter_new_round(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != Step::NewHeight)
        {
            log::debug!("enter_new_round({}/{}): invalid args, at {}", height, round, self.rs.hrs());
            return Ok(());
        }
        log::info!("enter_new_round({}/{}). current: {}", height, round, self.rs.hrs());

        if self.rs.round < round {
            self.rs.validators = self
                .rs
                .validators
                .copy_increment_proposer_priority(round - self.rs.round);
        }

        self.update_round_step(round, Step::NewRound);
        if round != Round::new(0) {
            // Round 0 keeps a proposal that arrived during the NewHeight step.
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        self.rs.votes.set_round(round.next())?;
        self.rs.triggered_timeout_precommit = false;

        let proposer = self
            .rs
            .validators
            .get_proposer()
            .map(|proposer| proposer.address);
        if let Some(proposer) = proposer {
            self.publish_event(Event::NewRound(NewRoundEvent {
                timestamp: SystemTime::now(),
                height,
                round,
                step: Step::NewRound,
                proposer,
            }));
        }

        let wait_for_txs = self.config.wait_for_txs()
            && round == Round::new(0)
            && !self.need_proof_block(height)?;
        if wait_for_txs {
            if !self.config.create_empty_blocks_interval.is_zero() {
                self.schedule_timeout(
                    self.config.create_empty_blocks_interval,
                    height,
                    round,
                    Step::NewRound,
                );
            }
            Ok(())
        } else {
            self.enter_propose(height, round)
        }
    }

    /// A block is needed at `height` to prove the app hash that the previous block's execution
    /// produced, even if there are no transactions for it.
    fn need_proof_block(&self, height: Height) -> Result<bool, ConsensusError> {
        let prev_height = match height.prev() {
            Some(prev_height) if prev_height > Height::new(0) => prev_height,
            _ => return Ok(true),
        };
        let last_block_meta = self.block_store.load_block_meta(prev_height)?;
        Ok(last_block_meta.map_or(true, |meta| meta.header.app_hash != self.state.app_hash))
    }

    fn enter_propose(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Propose <= self.rs.step)
        {
            log::debug!("enter_propose({}/{}): invalid args, at {}", height, round, self.rs.hrs());
            return Ok(());
        }
        log::info!("enter_propose({}/{}). current: {}", height, round, self.rs.hrs());

        self.schedule_timeout(self.config.propose(round), height, round, Step::Propose);

        if let Some(address) = self.priv_validator.as_ref().map(|pv| pv.address()) {
            if !self.rs.validators.has_address(&address) {
                log::debug!("This node is not a validator at height {}", height);
            } else if self
                .rs
                .validators
                .get_proposer()
                .map_or(false, |proposer| proposer.address == address)
            {
                log::info!("enter_propose: our turn to propose. proposer: {}", address);
                self.decide_proposal(height, round)?;
            } else {
                log::info!("enter_propose: not our turn to propose");
            }
        }

        self.update_round_step(round, Step::Propose);
        self.new_step()?;

        // Otherwise prevote once the rest of the proposal arrives, or after the timeout.
        if self.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    fn decide_proposal(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let (block, block_parts) = match (&self.rs.valid_block, &self.rs.valid_block_parts) {
            (Some(block), Some(parts)) => (block.clone(), parts.clone()),
            _ => match self.create_proposal_block()? {
                Some(block_and_parts) => block_and_parts,
                None => return Ok(()),
            },
        };

        // Otherwise a restarted node may not recompute the same proposal, and the signer would refuse
        // to sign anything.
        self.wal.flush_and_sync()?;

        let block_id = BlockID::new(block.hash(), block_parts.header());
        let mut proposal = Proposal::new(height, round, self.rs.valid_round, block_id);
        let chain_id = self.state.chain_id.clone();
        let signed = match &mut self.priv_validator {
            Some(priv_validator) => priv_validator.sign_proposal(&chain_id, &mut proposal),
            None => return Ok(()),
        };
        match signed {
            Ok(()) => {
                self.send_internal(ConsensusMessage::Proposal(ProposalMessage { proposal }));
                for index in 0..block_parts.total() {
                    if let Some(part) = block_parts.get_part(index as usize) {
                        self.send_internal(ConsensusMessage::BlockPart(BlockPartMessage {
                            height: self.rs.height,
                            round: self.rs.round,
                            part: part.clone(),
                        }));
                    }
                }
                log::info!("Signed proposal. height: {}, round: {}, block: {}", height, round, block_id);
            }
            Err(err) => {
                if !self.replay_mode {
                    log::error!(
                        "enter_propose: error signing proposal. height: {}, round: {}, err: {:?}",
                        height,
                        round,
                        err
                    );
                }
            }
        }
        Ok(())
    }

    fn create_proposal_block(&self) -> Result<Option<(Block, PartSet)>, ConsensusError> {
        let commit = if self.rs.height == Height::new(1) {
            Commit::empty()
        } else {
            match self
                .rs
                .last_commit
                .as_ref()
                .filter(|last_commit| last_commit.has_two_thirds_majority())
            {
                Some(last_commit) => last_commit.make_commit()?,
                None => {
                    log::error!("enter_propose: cannot propose anything: no commit for the previous block");
                    return Ok(None);
                }
            }
        };
        let proposer_address = match &self.priv_validator {
            Some(priv_validator) => priv_validator.address(),
            None => return Ok(None),
        };
        Ok(Some(self.block_exec.create_proposal_block(
            self.rs.height,
            &self.state,
            commit,
            proposer_address,
        )))
    }

    /// Returns true if the proposal block is complete, and, if the proposal has a POL round, the node
    /// has the POL.
    fn is_proposal_complete(&self) -> bool {
        let proposal = match (&self.rs.proposal, &self.rs.proposal_block) {
            (Some(proposal), Some(_)) => proposal,
            _ => return false,
        };
        match proposal.pol_round {
            None => true,
            Some(pol_round) => self
                .rs
                .votes
                .prevotes(pol_round)
                .map_or(false, |prevotes| prevotes.has_two_thirds_majority()),
        }
    }

    fn enter_prevote(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Prevote <= self.rs.step)
        {
            log::debug!("enter_prevote({}/{}): invalid args, at {}", height, round, self.rs.hrs());
            return Ok(());
        }
        log::info!("enter_prevote({}/{}). current: {}", height, round, self.rs.hrs());

        if self.is_proposal_complete() {
            self.publish_complete_proposal();
        }

        self.do_prevote()?;

        // Once +2/3 prevotes for anything arrive, add_vote moves on to PrevoteWait.
        self.update_round_step(round, Step::Prevote);
        self.new_step()
    }

    fn do_prevote(&mut self) -> Result<(), ConsensusError> {
        if let (Some(locked_block), Some(locked_parts)) =
            (&self.rs.locked_block, &self.rs.locked_block_parts)
        {
            log::info!("enter_prevote: block was locked");
            let block_id = BlockID::new(locked_block.hash(), locked_parts.header());
            return self.sign_add_vote(VoteType::Prevote, Some(block_id));
        }

        let (proposal_block, proposal_parts) =
            match (&self.rs.proposal_block, &self.rs.proposal_block_parts) {
                (Some(block), Some(parts)) => (block, parts),
                _ => {
                    log::info!("enter_prevote: proposal block is nil");
                    return self.sign_add_vote(VoteType::Prevote, None);
                }
            };

        if let Err(err) = self.block_exec.validate_block(&self.state, proposal_block) {
            log::error!("enter_prevote: proposal block is invalid: {:?}", err);
            return self.sign_add_vote(VoteType::Prevote, None);
        }

        log::info!("enter_prevote: proposal block is valid");
        let block_id = BlockID::new(proposal_block.hash(), proposal_parts.header());
        self.sign_add_vote(VoteType::Prevote, Some(block_id))
    }

    fn enter_prevote_wait(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::PrevoteWait <= self.rs.step)
        {
            log::debug!("enter_prevote_wait({}/{}): invalid args, at {}", height, round, self.rs.hrs());
            return Ok(());
        }
        if !self
            .rs
            .votes
            .prevotes(round)
            .map_or(false, |prevotes| prevotes.has_two_thirds_any())
        {
            log::error!("enter_prevote_wait({}/{}) without +2/3 prevotes", height, round);
            return Ok(());
        }
        log::info!("enter_prevote_wait({}/{}). current: {}", height, round, self.rs.hrs());

        self.schedule_timeout(self.config.prevote(round), height, round, Step::PrevoteWait);

        self.update_round_step(round, Step::PrevoteWait);
        self.new_step()
    }

    /// Precommit the block with a polka in `round` (locking on it), or nil if there is none.
    fn enter_precommit(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Precommit <= self.rs.step)
        {
            log::debug!("enter_precommit({}/{}): invalid args, at {}", height, round, self.rs.hrs());
            return Ok(());
        }
        log::info!("enter_precommit({}/{}). current: {}", height, round, self.rs.hrs());

        self.precommit(height, round)?;

        self.update_round_step(round, Step::Precommit);
        self.new_step()
    }

    fn precommit(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|prevotes| prevotes.two_thirds_majority());

        let block_id = match polka {
            None => {
                if self.rs.locked_block.is_some() {
                    log::info!("enter_precommit: no +2/3 prevotes while locked, precommitting nil");
                } else {
                    log::info!("enter_precommit: no +2/3 prevotes, precommitting nil");
                }
                return self.sign_add_vote(VoteType::Precommit, None);
            }
            Some(block_id) => block_id,
        };

        self.publish_round_state_event(|timestamp, height, round, step| {
            Event::Polka(PolkaEvent {
                timestamp,
                height,
                round,
                step,
            })
        });

        let block_id = match block_id {
            None => {
                if self.rs.locked_block.is_some() {
                    log::info!("enter_precommit: +2/3 prevoted for nil, unlocking");
                    self.unlock();
                } else {
                    log::info!("enter_precommit: +2/3 prevoted for nil");
                }
                return self.sign_add_vote(VoteType::Precommit, None);
            }
            Some(block_id) => block_id,
        };

        if hashes_to(&self.rs.locked_block, &block_id.hash) {
            log::info!("enter_precommit: +2/3 prevoted locked block, relocking");
            self.rs.locked_round = Some(round);
            self.publish_round_state_event(|timestamp, height, round, step| {
                Event::Relock(RelockEvent {
                    timestamp,
                    height,
                    round,
                    step,
                })
            });
            return self.sign_add_vote(VoteType::Precommit, Some(block_id));
        }

        if let Some(proposal_block) = &self.rs.proposal_block {
            if proposal_block.hashes_to(&block_id.hash) {
                if let Err(err) = self.block_exec.validate_block(&self.state, proposal_block) {
                    return Err(ConsensusError::InvalidPolkaBlock { height, round, err });
                }
                log::info!("enter_precommit: +2/3 prevoted proposal block, locking. hash: {}", block_id.hash);
                self.rs.locked_round = Some(round);
                self.rs.locked_block = self.rs.proposal_block.clone();
                self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                self.publish_round_state_event(|timestamp, height, round, step| {
                    Event::Lock(LockEvent {
                        timestamp,
                        height,
                        round,
                        step,
                    })
                });
                return self.sign_add_vote(VoteType::Precommit, Some(block_id));
            }
        }

        // A polka for a block we do not have: fetch it, unlock, and precommit nil.
        log::info!("enter_precommit: +2/3 prevotes for a block we do not have, precommitting nil");
        self.rs.locked_round = None;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        if !has_header(&self.rs.proposal_block_parts, &block_id) {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::from_header(&block_id.parts_header));
        }
        self.publish_round_state_event(|timestamp, height, round, step| {
            Event::Unlock(UnlockEvent {
                timestamp,
                height,
                round,
                step,
            })
        });
        self.sign_add_vote(VoteType::Precommit, None)
    }

    fn unlock(&mut self) {
        self.rs.locked_round = None;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        self.publish_round_state_event(|timestamp, height, round, step| {
            Event::Unlock(UnlockEvent {
                timestamp,
                height,
                round,
                step,
            })
        });
    }

    /// Wait a little for more precommits after +2/3 precommits for anything. The step does not change:
    /// only `triggered_timeout_precommit` records that the wait has started.
    fn enter_precommit_wait(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.triggered_timeout_precommit)
        {
            log::debug!("enter_precommit_wait({}/{}): invalid args, at {}", height, round, self.rs.hrs());
            return Ok(());
        }
        if !self
            .rs
            .votes
            .precommits(round)
            .map_or(false, |precommits| precommits.has_two_thirds_any())
        {
            log::error!("enter_precommit_wait({}/{}) without +2/3 precommits", height, round);
            return Ok(());
        }
        log::info!("enter_precommit_wait({}/{}). current: {}", height, round, self.rs.hrs());

        self.schedule_timeout(self.config.precommit(round), height, round, Step::PrecommitWait);

        self.rs.triggered_timeout_precommit = true;
        self.new_step()
    }

    fn enter_commit(&mut self, height: Height, commit_round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height || Step::Commit <= self.rs.step {
            log::debug!("enter_commit({}/{}): invalid args, at {}", height, commit_round, self.rs.hrs());
            return Ok(());
        }
        log::info!("enter_commit({}/{}). current: {}", height, commit_round, self.rs.hrs());

        let block_id = match self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|precommits| precommits.two_thirds_majority())
        {
            Some(Some(block_id)) => block_id,
            _ => return Err(ConsensusError::MissingCommitMajority { height }),
        };

        // The locks no longer matter, but the locked block may be the one being committed.
        if hashes_to(&self.rs.locked_block, &block_id.hash) {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }

        if !hashes_to(&self.rs.proposal_block, &block_id.hash)
            && !has_header(&self.rs.proposal_block_parts, &block_id)
        {
            // Start collecting the parts of the block being committed.
            self.rs.proposal_block = None;
            let parts = PartSet::from_header(&block_id.parts_header);
            self.announce_valid_block(&parts, true);
            self.rs.proposal_block_parts = Some(parts);
        }

        let round = self.rs.round;
        self.update_round_step(round, Step::Commit);
        self.rs.commit_round = Some(commit_round);
        self.rs.commit_time = Some(Timestamp::now());
        self.new_step()?;

        self.try_finalize_commit(height)
    }

    fn try_finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height {
            return Ok(());
        }
        let block_id = match self
            .rs
            .commit_round
            .and_then(|commit_round| self.rs.votes.precommits(commit_round))
            .and_then(|precommits| precommits.two_thirds_majority())
        {
            Some(Some(block_id)) => block_id,
            _ => {
                log::error!("Attempt to finalize failed: no +2/3 majority, or +2/3 was for nil");
                return Ok(());
            }
        };
        if !hashes_to(&self.rs.proposal_block, &block_id.hash) {
            log::info!(
                "Attempt to finalize failed: we do not have the commit block. commit block: {}",
                block_id.hash
            );
            return Ok(());
        }
        self.finalize_commit(height)
    }

    /// Store, log, and apply the decided block, then move to the next height.
    fn finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height || self.rs.step != Step::Commit {
            log::debug!("finalize_commit({}): invalid args, at {}", height, self.rs.hrs());
            return Ok(());
        }

        let precommits = match self
            .rs
            .commit_round
            .and_then(|commit_round| self.rs.votes.precommits(commit_round))
        {
            Some(precommits) => precommits,
            None => return Err(ConsensusError::MissingCommitMajority { height }),
        };
        let seen_commit = precommits
            .make_commit()
            .map_err(|_| ConsensusError::MissingCommitMajority { height })?;
        let (block, block_parts) = match (&self.rs.proposal_block, &self.rs.proposal_block_parts) {
            (Some(block), Some(parts))
                if parts.has_header(&seen_commit.block_id.parts_header)
                    && block.hashes_to(&seen_commit.block_id.hash) =>
            {
                (block.clone(), parts.clone())
            }
            _ => return Err(ConsensusError::MissingCommitMajority { height }),
        };
        if let Err(err) = self.block_exec.validate_block(&self.state, &block) {
            return Err(ConsensusError::InvalidCommittedBlock { height, err });
        }

        log::info!(
            "Finalizing commit of block with {} txs. height: {}, hash: {}",
            block.header.num_txs,
            height,
            block.hash()
        );

        if self.block_store.height() < block.height() {
            // The seen commit justifies the block locally, but may differ from the last commit
            // included in the next block.
            self.block_store
                .save_block(&block, &block_parts, &seen_commit)?;
        } else {
            log::info!("Calling finalize_commit on already stored block. height: {}", height);
        }

        self.wal.write_meta_sync(MetaMessage {
            height: height.next(),
        })?;

        let block_id = BlockID::new(block.hash(), block_parts.header());
        let state = self.block_exec.apply_block(&self.state, block_id, &block)?;

        self.update_to_state(state)?;
        self.schedule_round0();

        let future_height_msgs = mem::take(&mut self.future_height_msgs);
        self.pending_inputs.extend(
            future_height_msgs
                .into_iter()
                .map(ConsensusInput::Message),
        );
        Ok(())
    }

    fn set_proposal(&mut self, proposal: Proposal) -> Result<(), ConsensusError> {
        if self.rs.proposal.is_some() {
            return Ok(());
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            return Ok(());
        }
        proposal.validate_basic()?;
        if proposal.block_id.parts_header.total > self.max_block_parts() {
            return Err(ConsensusError::InvalidProposal(ProposalError::MalformedBlockID));
        }

        let proposer = self
            .rs
            .validators
            .get_proposer()
            .ok_or(ConsensusError::InvalidProposal(ProposalError::InvalidSignature))?;
        if !proposal.verify(&self.state.chain_id, &proposer.pub_key) {
            return Err(ConsensusError::InvalidProposal(ProposalError::InvalidSignature));
        }

        log::info!("Received proposal: {}", proposal);
        // Already set when committing, or when the current round has a valid block.
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts =
                Some(PartSet::from_header(&proposal.block_id.parts_header));
        }
        self.rs.proposal = Some(proposal);
        Ok(())
    }

    fn max_block_parts(&self) -> u32 {
        let max_bytes = self.state.consensus_params.block.max_data_bytes as usize
            + 2 * BLOCK_PART_SIZE_BYTES;
        (max_bytes / BLOCK_PART_SIZE_BYTES + 1) as u32
    }

    /// Add a part of the proposal block. Once the block is complete, move on to whichever step was
    /// waiting for it.
    fn add_proposal_block_part(&mut self, msg: BlockPartMessage) -> Result<bool, ConsensusError> {
        // Blocks might be re-proposed in a later round, so the round may differ.
        if msg.height != self.rs.height {
            return Ok(false);
        }
        let parts = match &mut self.rs.proposal_block_parts {
            Some(parts) => parts,
            None => return Ok(false),
        };
        let added = parts.add_part(msg.part)?;
        if !added || !parts.is_complete() {
            return Ok(added);
        }

        let bytes = parts.assemble()?;
        let block =
            Block::try_from_slice(&bytes).map_err(ConsensusError::UndecodableBlock)?;
        log::info!(
            "Received complete proposal block. height: {}, hash: {}",
            block.height(),
            block.hash()
        );
        self.rs.proposal_block = Some(block);
        self.publish_complete_proposal();

        let height = self.rs.height;
        let round = self.rs.round;
        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|prevotes| prevotes.two_thirds_majority());
        if let Some(Some(block_id)) = polka {
            if self.rs.valid_round.map_or(true, |valid_round| valid_round < round)
                && hashes_to(&self.rs.proposal_block, &block_id.hash)
            {
                log::info!("Updating valid block to new proposal block. valid round: {}", round);
                self.rs.valid_round = Some(round);
                self.rs.valid_block = self.rs.proposal_block.clone();
                self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
            }
        }

        if self.rs.step <= Step::Propose && self.is_proposal_complete() {
            self.enter_prevote(height, round)?;
            if polka.is_some() {
                self.enter_precommit(height, round)?;
            }
        } else if self.rs.step == Step::Commit {
            self.try_finalize_commit(height)?;
        }
        Ok(true)
    }

    fn try_add_vote(&mut self, vote: Vote, peer: Option<&PeerID>) -> Result<(), ConsensusError> {
        self.add_vote(vote, peer).map(|_| ())
    }

    /// Add `vote` to the right vote set, and act on any majority it completes.
    fn add_vote(&mut self, vote: Vote, peer: Option<&PeerID>) -> Result<bool, ConsensusError> {
        log::debug!("add_vote: {} from {:?}", vote, peer_name(&peer.cloned()));

        // A precommit for the previous height, arriving while we wait out timeout_commit.
        if vote.height.next() == self.rs.height {
            if !(self.rs.step == Step::NewHeight && vote.vote_type == VoteType::Precommit) {
                return Ok(false);
            }
            let result = match &mut self.rs.last_commit {
                Some(last_commit) => last_commit.add_vote(vote.clone()),
                None => return Ok(false),
            };
            if !self.handle_add_result(result, &vote)? {
                return Ok(false);
            }
            let has_all = match &self.rs.last_commit {
                Some(last_commit) => {
                    log::info!("Added to last commit: {}", last_commit);
                    last_commit.has_all()
                }
                None => return Ok(false),
            };
            self.publish_vote(&vote);
            self.broadcast_has_vote(&vote, peer);
            if self.config.skip_timeout_commit && has_all {
                self.enter_new_round(self.rs.height, Round::new(0))?;
            }
            return Ok(true);
        }

        if vote.height != self.rs.height {
            log::debug!(
                "Vote ignored and not added. vote height: {}, height: {}, peer: {:?}",
                vote.height,
                self.rs.height,
                peer_name(&peer.cloned())
            );
            return Ok(false);
        }

        let had_maj23 = self
            .rs
            .votes
            .vote_set(vote.round, vote.vote_type)
            .map_or(false, |vote_set| vote_set.has_two_thirds_majority());
        let result = self.rs.votes.add_vote(vote.clone(), peer);
        if !self.handle_add_result(result, &vote)? {
            return Ok(false);
        }

        self.publish_vote(&vote);
        self.broadcast_has_vote(&vote, peer);
        if !had_maj23 {
            self.broadcast_maj23(vote.round, vote.vote_type);
        }

        let height = self.rs.height;
        match vote.vote_type {
            VoteType::Prevote => self.on_prevote_added(height, vote.round)?,
            VoteType::Precommit => self.on_precommit_added(height, vote.round)?,
        }
        Ok(true)
    }

    /// Turn the result of adding a vote to a vote set into whether the vote was added, reporting
    /// Byzantine behavior on the way.
    fn handle_add_result(
        &self,
        result: Result<bool, VoteSetError>,
        vote: &Vote,
    ) -> Result<bool, ConsensusError> {
        match result {
            Ok(added) => Ok(added),
            Err(VoteSetError::ConflictingVotes {
                existing,
                conflicting,
                added,
            }) => {
                if self.report_conflicting_votes(existing, conflicting, vote) {
                    return Ok(false);
                }
                Ok(added)
            }
            Err(VoteSetError::ConflictingMajorities {
                first,
                second,
                evidence,
            }) => {
                log::error!(
                    "Conflicting +2/3 majorities at {}/{} {}: {:?} and {:?}",
                    vote.height,
                    vote.round,
                    vote.vote_type,
                    first,
                    second
                );
                if let Some((existing, conflicting)) = evidence {
                    self.report_conflicting_votes(existing, conflicting, vote);
                }
                Ok(true)
            }
            Err(VoteSetError::NonDeterministicSignature { index }) => {
                log::debug!("Vote from validator {} has a non-deterministic signature", index);
                Ok(false)
            }
            Err(err @ VoteSetError::GotVoteFromUnwantedRound { .. }) => {
                log::debug!("Vote not added: {:?}", err);
                Ok(false)
            }
            Err(err) => Err(ConsensusError::InvalidVote(err)),
        }
    }

    /// Log and publish a validator's conflicting votes. Returns true if the validator is this node.
    fn report_conflicting_votes(&self, existing: Vote, conflicting: Vote, vote: &Vote) -> bool {
        let own = self
            .priv_validator
            .as_ref()
            .map_or(false, |pv| pv.address() == vote.validator_address);
        if own {
            log::error!(
                "Found conflicting vote from ourselves. Did you reset a validator's signing state? vote: {}",
                vote
            );
            return true;
        }
        log::error!(
            "Found conflicting votes from validator {}: {} and {}",
            vote.validator_address,
            existing,
            conflicting
        );
        self.publish_event(Event::ConflictingVotes(ConflictingVotesEvent {
            timestamp: SystemTime::now(),
            vote_a: existing,
            vote_b: conflicting,
        }));
        false
    }

    fn on_prevote_added(&mut self, height: Height, vote_round: Round) -> Result<(), ConsensusError> {
        let (polka, has_two_thirds_any) = match self.rs.votes.prevotes(vote_round) {
            Some(prevotes) => {
                log::info!("Added to prevotes: {}", prevotes);
                (prevotes.two_thirds_majority(), prevotes.has_two_thirds_any())
            }
            None => return Ok(()),
        };

        if let Some(block_id) = polka {
            // A polka for a different block, later than our lock: unlock.
            let unlock = match (&self.rs.locked_block, self.rs.locked_round) {
                (Some(locked_block), Some(locked_round)) => {
                    locked_round < vote_round
                        && vote_round <= self.rs.round
                        && block_id.map_or(true, |block_id| !locked_block.hashes_to(&block_id.hash))
                }
                _ => false,
            };
            if unlock {
                log::info!(
                    "Unlocking because of POL. locked round: {:?}, POL round: {}",
                    self.rs.locked_round,
                    vote_round
                );
                self.unlock();
            }

            // A polka for a block in the current round makes it the valid block.
            if let Some(block_id) = block_id {
                if self.rs.valid_round.map_or(true, |valid_round| valid_round < vote_round)
                    && vote_round == self.rs.round
                {
                    if hashes_to(&self.rs.proposal_block, &block_id.hash) {
                        log::info!("Updating valid block because of POL. POL round: {}", vote_round);
                        self.rs.valid_round = Some(vote_round);
                        self.rs.valid_block = self.rs.proposal_block.clone();
                        self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                    } else {
                        log::info!(
                            "Valid block we do not know about. Setting proposal block to nil. block: {}",
                            block_id.hash
                        );
                        self.rs.proposal_block = None;
                    }
                    if !has_header(&self.rs.proposal_block_parts, &block_id) {
                        self.rs.proposal_block_parts =
                            Some(PartSet::from_header(&block_id.parts_header));
                    }
                    if let Some(parts) = self.rs.proposal_block_parts.clone() {
                        self.announce_valid_block(&parts, false);
                    }
                }
            }
        }

        if self.rs.round < vote_round && has_two_thirds_any {
            // Skip to the round that +2/3 of the voting power is already in.
            self.enter_new_round(height, vote_round)
        } else if self.rs.round == vote_round && Step::Prevote <= self.rs.step {
            match polka {
                Some(block_id) if self.is_proposal_complete() || block_id.is_none() => {
                    self.enter_precommit(height, vote_round)
                }
                _ if has_two_thirds_any => self.enter_prevote_wait(height, vote_round),
                _ => Ok(()),
            }
        } else if self
            .rs
            .proposal
            .as_ref()
            .map_or(false, |proposal| proposal.pol_round == Some(vote_round))
        {
            // The POL of the current proposal may just have completed.
            if self.is_proposal_complete() {
                self.enter_prevote(height, self.rs.round)
            } else {
                Ok(())
            }
        } else {
            Ok(())
        }
    }

    fn on_precommit_added(
        &mut self,
        height: Height,
        vote_round: Round,
    ) -> Result<(), ConsensusError> {
        let (majority, has_two_thirds_any, has_all) = match self.rs.votes.precommits(vote_round) {
            Some(precommits) => {
                log::info!("Added to precommits: {}", precommits);
                (
                    precommits.two_thirds_majority(),
                    precommits.has_two_thirds_any(),
                    precommits.has_all(),
                )
            }
            None => return Ok(()),
        };

        match majority {
            Some(block_id) => {
                // The majority may be for a later round.
                self.enter_new_round(height, vote_round)?;
                self.enter_precommit(height, vote_round)?;
                if block_id.is_some() {
                    self.enter_commit(height, vote_round)?;
                    if self.config.skip_timeout_commit && has_all {
                        self.enter_new_round(self.rs.height, Round::new(0))?;
                    }
                    Ok(())
                } else {
                    self.enter_precommit_wait(height, vote_round)
                }
            }
            None if self.rs.round <= vote_round && has_two_thirds_any => {
                self.enter_new_round(height, vote_round)?;
                self.enter_precommit_wait(height, vote_round)
            }
            None => Ok(()),
        }
    }

    /// Sign a vote for `block_id` (nil if `None`) at the current height and round, and queue it.
    fn sign_add_vote(
        &mut self,
        vote_type: VoteType,
        block_id: Option<BlockID>,
    ) -> Result<(), ConsensusError> {
        let address = match &self.priv_validator {
            Some(priv_validator) => priv_validator.address(),
            None => return Ok(()),
        };
        let validator_index = match self.rs.validators.get_by_address(&address) {
            Some((index, _)) => index as u32,
            None => return Ok(()),
        };

        // Otherwise a restarted node may not recompute the same vote, and the signer would refuse to
        // sign anything.
        self.wal.flush_and_sync()?;

        let mut vote = Vote {
            vote_type,
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            timestamp: self.vote_time(),
            validator_address: address,
            validator_index,
            signature: crate::types::basic::SignatureBytes::empty(),
        };
        let chain_id = self.state.chain_id.clone();
        let signed: Result<(), SignerError> = match &mut self.priv_validator {
            Some(priv_validator) => priv_validator.sign_vote(&chain_id, &mut vote),
            None => return Ok(()),
        };
        match signed {
            Ok(()) => {
                log::info!("Signed and pushed vote: {}", vote);
                self.send_internal(ConsensusMessage::Vote(VoteMessage { vote }));
            }
            Err(err) => {
                if !self.replay_mode {
                    log::error!(
                        "Error signing vote. height: {}, round: {}, vote: {}, err: {:?}",
                        self.rs.height,
                        self.rs.round,
                        vote,
                        err
                    );
                }
            }
        }
        Ok(())
    }

    /// Now, unless that is not later than the time of the block being voted for.
    fn vote_time(&self) -> Timestamp {
        let now = Timestamp::now();
        let time_iota = Duration::from_millis(self.state.consensus_params.block.time_iota_ms);
        let min_vote_time = match (&self.rs.locked_block, &self.rs.proposal_block) {
            (Some(block), _) | (None, Some(block)) => block.header.time.plus(time_iota),
            (None, None) => now,
        };
        if now > min_vote_time {
            now
        } else {
            min_vote_time
        }
    }

    fn send_internal(&mut self, msg: ConsensusMessage) {
        self.internal_queue.push_back(MsgInfo::internal(msg));
    }

    /* ↓↓↓ Outbound messages and events ↓↓↓ */

    fn broadcast(&mut self, msg: &ConsensusMessage) {
        if self.replay_mode || !self.started {
            return;
        }
        if let Some(broadcaster) = &mut self.broadcaster {
            broadcaster.broadcast(msg);
        }
    }

    fn broadcast_has_vote(&mut self, vote: &Vote, peer: Option<&PeerID>) {
        if peer.is_none() {
            return;
        }
        self.broadcast(&ConsensusMessage::HasVote(HasVoteMessage {
            height: vote.height,
            round: vote.round,
            vote_type: vote.vote_type,
            index: vote.validator_index,
        }));
    }

    fn broadcast_maj23(&mut self, round: Round, vote_type: VoteType) {
        let block_id = match self
            .rs
            .votes
            .vote_set(round, vote_type)
            .and_then(|vote_set| vote_set.two_thirds_majority())
        {
            Some(block_id) => block_id,
            None => return,
        };
        self.broadcast(&ConsensusMessage::VoteSetMaj23(VoteSetMaj23Message {
            height: self.rs.height,
            round,
            vote_type,
            block_id,
        }));
    }

    fn announce_valid_block(&mut self, parts: &PartSet, is_commit: bool) {
        self.publish_event(Event::NewValidBlock(NewValidBlockEvent {
            timestamp: SystemTime::now(),
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
            block_parts_header: parts.header(),
            is_commit,
        }));
        self.broadcast(&ConsensusMessage::NewValidBlock(NewValidBlockMessage {
            height: self.rs.height,
            round: self.rs.round,
            block_parts_header: parts.header(),
            block_parts: parts.bit_array().clone(),
            is_commit,
        }));
    }

    fn publish_event(&self, event: Event) {
        Event::publish(&self.event_publisher, event)
    }

    fn publish_round_state_event(
        &self,
        make_event: impl FnOnce(SystemTime, Height, Round, Step) -> Event,
    ) {
        self.publish_event(make_event(
            SystemTime::now(),
            self.rs.height,
            self.rs.round,
            self.rs.step,
        ))
    }

    fn publish_timeout_wait(&self) {
        self.publish_round_state_event(|timestamp, height, round, step| {
            Event::TimeoutWait(TimeoutWaitEvent {
                timestamp,
                height,
                round,
                step,
            })
        })
    }

    fn publish_complete_proposal(&self) {
        let block_id = match (self.rs.proposal_block_id(), &self.rs.proposal) {
            (Some(block_id), _) => block_id,
            (None, Some(proposal)) => proposal.block_id,
            (None, None) => return,
        };
        self.publish_round_state_event(|timestamp, height, round, step| {
            Event::CompleteProposal(CompleteProposalEvent {
                timestamp,
                height,
                round,
                step,
                block_id,
            })
        })
    }

    fn publish_vote(&self, vote: &Vote) {
        self.publish_event(Event::Vote(VoteEvent {
            timestamp: SystemTime::now(),
            vote: vote.clone(),
        }))
    }

    fn publish_snapshot(&self) {
        match self.snapshot.lock() {
            Ok(mut snapshot) => *snapshot = self.rs.snapshot(),
            Err(_) => log::error!("Round state snapshot lock poisoned"),
        }
    }
}

/// Runs a [ConsensusState] on a thread of its own.
pub struct ConsensusService<K: KVStore, N: Network> {
    engine: Option<ConsensusState<K, N>>,
    snapshot: Arc<Mutex<RoundStateSnapshot>>,
    input_sender: SyncSender<ConsensusInput>,
    engine_thread: Option<JoinHandle<Result<(), ConsensusError>>>,
    shutdown: Option<Sender<()>>,
}

impl<K: KVStore, N: Network + 'static> ConsensusService<K, N> {
    pub fn new(engine: ConsensusState<K, N>) -> ConsensusService<K, N> {
        ConsensusService {
            snapshot: engine.round_state_snapshot(),
            input_sender: engine.input_sender(),
            engine: Some(engine),
            engine_thread: None,
            shutdown: None,
        }
    }

    pub fn round_state(&self) -> Option<RoundStateSnapshot> {
        self.snapshot.lock().ok().map(|snapshot| snapshot.clone())
    }

    pub fn input_sender(&self) -> SyncSender<ConsensusInput> {
        self.input_sender.clone()
    }

    /// Returns true if the engine thread was started and has not exited.
    pub fn is_running(&self) -> bool {
        self.engine_thread
            .as_ref()
            .map_or(false, |engine_thread| !engine_thread.is_finished())
    }
}

impl<K: KVStore, N: Network + 'static> Service for ConsensusService<K, N> {
    /// Replay the WAL on the calling thread, then spawn the receive loop.
    fn start(&mut self) -> Result<(), ServiceError> {
        let mut engine = self.engine.take().ok_or(ServiceError::AlreadyStarted)?;
        engine
            .start()
            .map_err(|err| ServiceError::Failed(err.to_string()))?;

        let (shutdown, shutdown_receiver) = mpsc::channel();
        self.shutdown = Some(shutdown);
        self.engine_thread = Some(thread::spawn(move || {
            let result = engine.run(shutdown_receiver);
            if let Err(err) = &result {
                log::error!("Consensus engine stopped on fatal error: {}", err);
            }
            if let Err(err) = engine.stop() {
                log::error!("Failed to stop consensus engine cleanly: {}", err);
            }
            result
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        let engine_thread = self.engine_thread.take().ok_or(ServiceError::NotStarted)?;
        if let Some(shutdown) = self.shutdown.take() {
            if shutdown.send(()).is_err() {
                log::debug!("Consensus engine thread already exited");
            }
        }
        match engine_thread.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ServiceError::Failed(err.to_string())),
            Err(_) => Err(ServiceError::Failed(String::from(
                "consensus engine thread panicked",
            ))),
        }
    }

    fn wait(&mut self) {
        if let Some(engine_thread) = self.engine_thread.take() {
            let _ = engine_thread.join();
        }
    }
}

/// Whether `msg` can cause a state transition, and therefore has to be written to the WAL.
fn drives_state_machine(msg: &ConsensusMessage) -> bool {
    matches!(
        msg,
        ConsensusMessage::Proposal(_) | ConsensusMessage::BlockPart(_) | ConsensusMessage::Vote(_)
    )
}

fn msg_height(msg: &ConsensusMessage) -> Option<Height> {
    match msg {
        ConsensusMessage::Proposal(msg) => Some(msg.proposal.height),
        ConsensusMessage::BlockPart(msg) => Some(msg.height),
        ConsensusMessage::Vote(msg) => Some(msg.vote.height),
        _ => None,
    }
}

fn hashes_to(block: &Option<Block>, hash: &CryptoHash) -> bool {
    block.as_ref().map_or(false, |block| block.hashes_to(hash))
}

fn has_header(parts: &Option<PartSet>, block_id: &BlockID) -> bool {
    parts
        .as_ref()
        .map_or(false, |parts| parts.has_header(&block_id.parts_header))
}

fn peer_name(peer: &Option<PeerID>) -> String {
    peer.as_ref()
        .map_or(String::from("local"), |peer| peer.to_string())
}

#[derive(Debug)]
pub enum ConsensusError {
    // Fatal: the engine cannot go on.
    WAL(WALError),
    BlockStore(BlockStoreError),
    BlockExecution(BlockExecutionError),
    Service(ServiceError),
    InvalidCommittedBlock {
        height: Height,
        err: InvalidBlockError,
    },
    InvalidPolkaBlock {
        height: Height,
        round: Round,
        err: InvalidBlockError,
    },
    MissingCommitMajority {
        height: Height,
    },
    MissingSeenCommit {
        height: Height,
    },
    InvalidSeenCommit(VoteSetError),
    StateHeightMismatch {
        expected: Height,
        actual: Height,
    },
    // Soft: the input that caused them is dropped.
    InvalidVote(VoteSetError),
    InvalidProposal(ProposalError),
    InvalidBlockPart(PartSetError),
    UndecodableBlock(std::io::Error),
    WALContainsEndHeight {
        height: Height,
    },
    WALMissingHeight {
        height: Height,
    },
}

impl ConsensusError {
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConsensusError::InvalidVote(_)
                | ConsensusError::InvalidProposal(_)
                | ConsensusError::InvalidBlockPart(_)
                | ConsensusError::UndecodableBlock(_)
                | ConsensusError::WALContainsEndHeight { .. }
                | ConsensusError::WALMissingHeight { .. }
        )
    }
}

impl Display for ConsensusError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::WAL(err) => write!(f, "WAL error: {:?}", err),
            ConsensusError::BlockStore(err) => write!(f, "block store error: {:?}", err),
            ConsensusError::BlockExecution(err) => write!(
                f,
                "error applying block, did the application crash? {:?}",
                err
            ),
            ConsensusError::Service(err) => write!(f, "{}", err),
            ConsensusError::InvalidCommittedBlock { height, err } => {
                write!(f, "+2/3 committed an invalid block at height {}: {:?}", height, err)
            }
            ConsensusError::InvalidPolkaBlock { height, round, err } => write!(
                f,
                "+2/3 prevoted for an invalid block at {}/{}: {:?}",
                height, round, err
            ),
            ConsensusError::MissingCommitMajority { height } => {
                write!(f, "no +2/3 precommits for the block at height {}", height)
            }
            ConsensusError::MissingSeenCommit { height } => {
                write!(f, "no seen commit stored for height {}", height)
            }
            ConsensusError::InvalidSeenCommit(err) => {
                write!(f, "failed to reconstruct last commit: {:?}", err)
            }
            ConsensusError::StateHeightMismatch { expected, actual } => write!(
                f,
                "update_to_state expected state height of {} but found {}",
                expected, actual
            ),
            ConsensusError::InvalidVote(err) => write!(f, "invalid vote: {:?}", err),
            ConsensusError::InvalidProposal(err) => write!(f, "invalid proposal: {:?}", err),
            ConsensusError::InvalidBlockPart(err) => write!(f, "invalid block part: {:?}", err),
            ConsensusError::UndecodableBlock(err) => write!(f, "undecodable block: {}", err),
            ConsensusError::WALContainsEndHeight { height } => {
                write!(f, "WAL should not contain the marker of height {}", height.next())
            }
            ConsensusError::WALMissingHeight { height } => write!(
                f,
                "cannot replay height {}: WAL does not contain its marker",
                height
            ),
        }
    }
}

impl From<WALError> for ConsensusError {
    fn from(value: WALError) -> Self {
        ConsensusError::WAL(value)
    }
}

impl From<BlockStoreError> for ConsensusError {
    fn from(value: BlockStoreError) -> Self {
        ConsensusError::BlockStore(value)
    }
}

impl From<BlockExecutionError> for ConsensusError {
    fn from(value: BlockExecutionError) -> Self {
        ConsensusError::BlockExecution(value)
    }
}

impl From<ServiceError> for ConsensusError {
    fn from(value: ServiceError) -> Self {
        ConsensusError::Service(value)
    }
}

impl From<VoteSetError> for ConsensusError {
    fn from(value: VoteSetError) -> Self {
        ConsensusError::InvalidVote(value)
    }
}

impl From<ProposalError> for ConsensusError {
    fn from(value: ProposalError) -> Self {
        ConsensusError::InvalidProposal(value)
    }
}

impl From<PartSetError> for ConsensusError {
    fn from(value: PartSetError) -> Self {
        ConsensusError::InvalidBlockPart(value)
    }
}
