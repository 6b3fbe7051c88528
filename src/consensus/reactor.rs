/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The bridge between the [Network] and the consensus engine.
//!
//! Inbound, the [ConsensusReactor] decodes frames with the node's [MessageCodec], keeps track of what
//! each peer has told us about its own round state, and forwards the messages that drive the engine
//! (proposals, block parts, votes, and +2/3 claims) into the engine's input queue. Outbound, the engine
//! uses a [Broadcaster] to encode and send its own messages.

use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};

use crate::networking::{ChannelID, Network};
use crate::types::{
    basic::{Height, PeerID, Round, Step},
    bit_array::BitArray,
    part_set::{PartSetHeader, MAX_BLOCK_PARTS_COUNT},
    vote::VoteType,
    vote_set::MAX_VOTES_COUNT,
};

use super::codec::MessageCodec;
use super::messages::{ConsensusInput, ConsensusMessage, MsgInfo};

/// Encodes the engine's outbound messages and hands them to the network.
pub struct Broadcaster<N: Network> {
    network: N,
    codec: MessageCodec,
}

impl<N: Network> Broadcaster<N> {
    pub fn new(network: N, codec: MessageCodec) -> Broadcaster<N> {
        Broadcaster { network, codec }
    }

    pub fn broadcast(&mut self, msg: &ConsensusMessage) {
        match self.codec.encode(msg) {
            Ok((channel, bytes)) => self.network.broadcast(channel, bytes),
            Err(err) => log::error!("Failed to encode {} for broadcast: {:?}", msg.name(), err),
        }
    }

    pub fn send(&mut self, peer: PeerID, msg: &ConsensusMessage) {
        match self.codec.encode(msg) {
            Ok((channel, bytes)) => self.network.send(peer, channel, bytes),
            Err(err) => log::error!("Failed to encode {} for {}: {:?}", msg.name(), peer, err),
        }
    }
}

/// Votes a peer has are tracked for rounds at most this far from the peer's current round, and for its
/// proposal's POL round.
pub const PEER_VOTE_ROUND_WINDOW: u32 = 1;

fn tracks_round(current: Round, pol_round: Option<Round>, round: Round) -> bool {
    pol_round == Some(round)
        || (round.int().saturating_add(PEER_VOTE_ROUND_WINDOW) >= current.int()
            && round.int() <= current.int().saturating_add(PEER_VOTE_ROUND_WINDOW))
}

/// What a peer has told us about its progress through the current height.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct PeerRoundState {
    pub height: Height,
    pub round: Round,
    pub step: Option<Step>,
    pub last_commit_round: Option<Round>,
    pub proposal: bool,
    pub proposal_block_parts_header: Option<PartSetHeader>,
    pub proposal_block_parts: BTreeSet<u32>,
    pub proposal_pol_round: Option<Round>,
    pub proposal_pol: Option<BitArray>,
    /// Indices of the validators whose votes the peer has, per round and vote type.
    pub votes: HashMap<(Round, VoteType), BTreeSet<u32>>,
}

impl PeerRoundState {
    pub fn has_vote(&self, round: Round, vote_type: VoteType, index: u32) -> bool {
        self.votes
            .get(&(round, vote_type))
            .map_or(false, |indices| indices.contains(&index))
    }

    fn set_has_vote(&mut self, height: Height, round: Round, vote_type: VoteType, index: u32) {
        if self.height != height
            || index as usize >= MAX_VOTES_COUNT
            || !tracks_round(self.round, self.proposal_pol_round, round)
        {
            return;
        }
        self.votes.entry((round, vote_type)).or_default().insert(index);
    }

    fn apply_new_round_step(
        &mut self,
        height: Height,
        round: Round,
        step: Step,
        last_commit_round: Option<Round>,
    ) {
        if (height, round, Some(step)) <= (self.height, self.round, self.step) {
            return;
        }
        if height != self.height || round != self.round {
            self.proposal = false;
            self.proposal_block_parts_header = None;
            self.proposal_block_parts.clear();
            self.proposal_pol_round = None;
            self.proposal_pol = None;
        }
        if height != self.height {
            self.votes.clear();
        }
        self.height = height;
        self.round = round;
        self.step = Some(step);
        self.last_commit_round = last_commit_round;

        let pol_round = self.proposal_pol_round;
        self.votes
            .retain(|(vote_round, _), _| tracks_round(round, pol_round, *vote_round));
    }
}

/// Receives frames from the network on behalf of the engine. Cheap to clone: clones share their peer
/// states.
#[derive(Clone)]
pub struct ConsensusReactor {
    codec: MessageCodec,
    input_sender: SyncSender<ConsensusInput>,
    peer_states: Arc<Mutex<HashMap<PeerID, PeerRoundState>>>,
}

impl ConsensusReactor {
    pub fn new(codec: MessageCodec, input_sender: SyncSender<ConsensusInput>) -> ConsensusReactor {
        ConsensusReactor {
            codec,
            input_sender,
            peer_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn peer_state(&self, peer: &PeerID) -> Option<PeerRoundState> {
        self.peer_states
            .lock()
            .ok()
            .and_then(|peer_states| peer_states.get(peer).cloned())
    }

    /// Handle a frame received from `peer` on `channel`. Frames that fail to decode are logged and
    /// dropped.
    pub fn receive(&mut self, channel: ChannelID, peer: PeerID, bytes: &[u8]) {
        let msg = match self.codec.decode(channel, bytes) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("Dropping frame from {} on channel {}: {:?}", peer, channel, err);
                return;
            }
        };
        log::trace!("Received {} from {}", msg.name(), peer);

        self.update_peer_state(&peer, &msg);

        match msg {
            ConsensusMessage::Proposal(_)
            | ConsensusMessage::BlockPart(_)
            | ConsensusMessage::Vote(_)
            | ConsensusMessage::VoteSetMaj23(_) => {
                let input = ConsensusInput::Message(MsgInfo::from_peer(msg, peer));
                if self.input_sender.send(input).is_err() {
                    log::debug!("Consensus engine stopped, dropping message");
                }
            }
            ConsensusMessage::NewRoundStep(_)
            | ConsensusMessage::NewValidBlock(_)
            | ConsensusMessage::ProposalPOL(_)
            | ConsensusMessage::HasVote(_)
            | ConsensusMessage::VoteSetBits(_) => (),
        }
    }

    fn update_peer_state(&self, peer: &PeerID, msg: &ConsensusMessage) {
        let mut peer_states = match self.peer_states.lock() {
            Ok(peer_states) => peer_states,
            Err(_) => return,
        };
        let peer_state = peer_states.entry(peer.clone()).or_default();

        match msg {
            ConsensusMessage::NewRoundStep(msg) => peer_state.apply_new_round_step(
                msg.height,
                msg.round,
                msg.step,
                msg.last_commit_round,
            ),
            ConsensusMessage::NewValidBlock(msg) => {
                if peer_state.height != msg.height
                    || (peer_state.round != msg.round && !msg.is_commit)
                {
                    return;
                }
                peer_state.proposal_block_parts_header = Some(msg.block_parts_header);
                peer_state.proposal_block_parts =
                    msg.block_parts.ones().map(|index| index as u32).collect();
            }
            ConsensusMessage::Proposal(msg) => {
                let proposal = &msg.proposal;
                if peer_state.height != proposal.height
                    || peer_state.round != proposal.round
                    || peer_state.proposal
                {
                    return;
                }
                peer_state.proposal = true;
                if peer_state.proposal_block_parts_header.is_none() {
                    peer_state.proposal_block_parts_header = Some(proposal.block_id.parts_header);
                }
                peer_state.proposal_pol_round = proposal.pol_round;
            }
            ConsensusMessage::ProposalPOL(msg) => {
                if peer_state.height != msg.height
                    || peer_state.proposal_pol_round != Some(msg.proposal_pol_round)
                {
                    return;
                }
                peer_state.proposal_pol = Some(msg.proposal_pol.clone());
            }
            ConsensusMessage::BlockPart(msg) => {
                let total = peer_state
                    .proposal_block_parts_header
                    .map_or(MAX_BLOCK_PARTS_COUNT, |header| header.total);
                if peer_state.height == msg.height
                    && peer_state.round == msg.round
                    && msg.part.index < total
                {
                    peer_state.proposal_block_parts.insert(msg.part.index);
                }
            }
            ConsensusMessage::Vote(msg) => peer_state.set_has_vote(
                msg.vote.height,
                msg.vote.round,
                msg.vote.vote_type,
                msg.vote.validator_index,
            ),
            ConsensusMessage::HasVote(msg) => {
                peer_state.set_has_vote(msg.height, msg.round, msg.vote_type, msg.index)
            }
            ConsensusMessage::VoteSetBits(msg) => {
                for index in msg.votes.ones() {
                    peer_state.set_has_vote(msg.height, msg.round, msg.vote_type, index as u32);
                }
            }
            ConsensusMessage::VoteSetMaj23(_) => (),
        }
    }
}
