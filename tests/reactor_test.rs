use std::sync::mpsc;

use log::LevelFilter;
use tendermint_rs::{
    consensus::{
        codec::{CodecError, MessageCodec, STATE_CHANNEL, VOTE_CHANNEL, VOTE_SET_BITS_CHANNEL},
        messages::{
            ConsensusInput, ConsensusMessage, HasVoteMessage, MessageError, MsgInfo,
            NewRoundStepMessage, VoteMessage, VoteSetBitsMessage,
        },
        reactor::ConsensusReactor,
    },
    types::{
        basic::{Height, PeerID, Round, Step},
        bit_array::BitArray,
        vote::VoteType,
        vote_set::MAX_VOTES_COUNT,
    },
};

mod common;

use crate::common::{
    logging::setup_logger,
    validators::{genesis, signed_vote, signing_keys},
};

fn new_round_step(
    height: u64,
    round: u32,
    step: Step,
    last_commit_round: Option<Round>,
) -> ConsensusMessage {
    ConsensusMessage::NewRoundStep(NewRoundStepMessage {
        height: Height::new(height),
        round: Round::new(round),
        step,
        seconds_since_start_time: 0,
        last_commit_round,
    })
}

#[test]
fn codec_rejects_bad_frames_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.
    let codec = MessageCodec::default();
    let msg = new_round_step(1, 0, Step::Propose, None);

    // 2. A well-formed message decodes on its own channel only.
    let (channel, bytes) = codec.encode(&msg).unwrap();
    assert_eq!(channel, STATE_CHANNEL);
    assert_eq!(codec.decode(STATE_CHANNEL, &bytes).unwrap(), msg);
    match codec.decode(VOTE_CHANNEL, &bytes) {
        Err(CodecError::WrongChannel {
            msg,
            expected,
            actual,
        }) => {
            assert_eq!(msg, "NewRoundStep");
            assert_eq!(expected, STATE_CHANNEL);
            assert_eq!(actual, VOTE_CHANNEL);
        }
        other => panic!("expected WrongChannel, got {:?}", other),
    }

    // 3. Messages that fail their stateless checks are rejected.
    log::debug!("Decoding invalid NewRoundStep messages.");
    let (_, bytes) = codec.encode(&new_round_step(1, 0, Step::Propose, Some(Round::new(0)))).unwrap();
    assert!(matches!(
        codec.decode(STATE_CHANNEL, &bytes),
        Err(CodecError::InvalidMessage(MessageError::UnexpectedLastCommitRound))
    ));
    let (_, bytes) = codec.encode(&new_round_step(2, 0, Step::Propose, None)).unwrap();
    assert!(matches!(
        codec.decode(STATE_CHANNEL, &bytes),
        Err(CodecError::InvalidMessage(MessageError::MissingLastCommitRound))
    ));

    // 4. Frames that are not messages, or too large, are rejected.
    assert!(matches!(
        codec.decode(STATE_CHANNEL, &[0xff, 0x01, 0x02]),
        Err(CodecError::Borsh(_))
    ));
    let small_codec = MessageCodec::new(8);
    assert!(matches!(
        small_codec.encode(&msg),
        Err(CodecError::MessageTooBig { max: 8, .. })
    ));
    let (_, bytes) = codec.encode(&msg).unwrap();
    assert!(matches!(
        small_codec.decode(STATE_CHANNEL, &bytes),
        Err(CodecError::MessageTooBig { max: 8, .. })
    ));
}

#[test]
fn reactor_tracks_peers_and_forwards_messages_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Prepare a reactor whose engine is a channel.
    let codec = MessageCodec::default();
    let (input_sender, input_receiver) = mpsc::sync_channel(16);
    let mut reactor = ConsensusReactor::new(codec, input_sender);
    let peer = PeerID::new("peer-0");

    // 1.2. Prepare a vote to receive.
    let keys = signing_keys(4);
    let validators = genesis(&keys).validator_set().unwrap();
    let vote = signed_vote(&keys[1], &validators, VoteType::Prevote, Height::new(1), Round::new(0), None);

    // 2. A NewRoundStep message updates the peer's state, and goes no further.
    log::debug!("Receiving NewRoundStep.");
    let (channel, bytes) = codec.encode(&new_round_step(1, 0, Step::Prevote, None)).unwrap();
    reactor.receive(channel, peer.clone(), &bytes);
    let peer_state = reactor.peer_state(&peer).unwrap();
    assert_eq!(peer_state.height, Height::new(1));
    assert_eq!(peer_state.round, Round::new(0));
    assert_eq!(peer_state.step, Some(Step::Prevote));
    assert!(input_receiver.try_recv().is_err());

    // 2.1. Messages about earlier steps are ignored.
    let (channel, bytes) = codec.encode(&new_round_step(1, 0, Step::Propose, None)).unwrap();
    reactor.receive(channel, peer.clone(), &bytes);
    assert_eq!(reactor.peer_state(&peer).unwrap().step, Some(Step::Prevote));

    // 3. A vote is forwarded to the engine, and recorded as one the peer has.
    log::debug!("Receiving a vote.");
    let vote_msg = ConsensusMessage::Vote(VoteMessage { vote: vote.clone() });
    let (channel, bytes) = codec.encode(&vote_msg).unwrap();
    assert_eq!(channel, VOTE_CHANNEL);
    reactor.receive(channel, peer.clone(), &bytes);
    assert_eq!(
        input_receiver.try_recv().unwrap(),
        ConsensusInput::Message(MsgInfo::from_peer(vote_msg.clone(), peer.clone()))
    );
    assert!(reactor
        .peer_state(&peer)
        .unwrap()
        .has_vote(Round::new(0), VoteType::Prevote, vote.validator_index));

    // 4. HasVote only updates the peer's state.
    let has_vote = ConsensusMessage::HasVote(HasVoteMessage {
        height: Height::new(1),
        round: Round::new(0),
        vote_type: VoteType::Precommit,
        index: 3,
    });
    let (channel, bytes) = codec.encode(&has_vote).unwrap();
    reactor.receive(channel, peer.clone(), &bytes);
    assert!(reactor
        .peer_state(&peer)
        .unwrap()
        .has_vote(Round::new(0), VoteType::Precommit, 3));
    assert!(input_receiver.try_recv().is_err());

    // 5. Bad frames are dropped.
    log::debug!("Receiving bad frames.");
    reactor.receive(VOTE_CHANNEL, peer.clone(), &[0xff; 4]);
    let (_, bytes) = codec.encode(&vote_msg).unwrap();
    reactor.receive(STATE_CHANNEL, peer.clone(), &bytes);
    assert!(input_receiver.try_recv().is_err());

    // 6. Peers that never sent anything have no state.
    assert_eq!(reactor.peer_state(&PeerID::new("peer-1")), None);
}

#[test]
fn reactor_bounds_peer_claims_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.
    let codec = MessageCodec::default();
    let (input_sender, input_receiver) = mpsc::sync_channel(16);
    let mut reactor = ConsensusReactor::new(codec, input_sender);
    let peer = PeerID::new("peer-0");
    let (channel, bytes) = codec.encode(&new_round_step(1, 0, Step::Prevote, None)).unwrap();
    reactor.receive(channel, peer.clone(), &bytes);

    let vote_set_bits = |round: u32, votes: BitArray| {
        ConsensusMessage::VoteSetBits(VoteSetBitsMessage {
            height: Height::new(1),
            round: Round::new(round),
            vote_type: VoteType::Prevote,
            block_id: None,
            votes,
        })
    };
    let has_vote = |height: u64, round: u32, index: u32| {
        ConsensusMessage::HasVote(HasVoteMessage {
            height: Height::new(height),
            round: Round::new(round),
            vote_type: VoteType::Precommit,
            index,
        })
    };

    // 2. A well-formed VoteSetBits message records every vote it claims.
    let mut votes = BitArray::new(4);
    votes.set_index(1, true);
    votes.set_index(3, true);
    let (channel, bytes) = codec.encode(&vote_set_bits(0, votes)).unwrap();
    assert_eq!(channel, VOTE_SET_BITS_CHANNEL);
    reactor.receive(channel, peer.clone(), &bytes);
    let peer_state = reactor.peer_state(&peer).unwrap();
    assert!(peer_state.has_vote(Round::new(0), VoteType::Prevote, 1));
    assert!(peer_state.has_vote(Round::new(0), VoteType::Prevote, 3));
    assert!(!peer_state.has_vote(Round::new(0), VoteType::Prevote, 2));

    // 3. A bit array whose size disagrees with its words is rejected before it reaches the reactor.
    log::debug!("Receiving a VoteSetBits message with a malformed bit array.");
    let (_, mut bytes) = codec.encode(&vote_set_bits(0, BitArray::new(4))).unwrap();
    // The encoding ends with the bit array: its size, the length of its words, and one word.
    bytes.truncate(bytes.len() - 16);
    bytes.extend_from_slice(&1000u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    assert!(matches!(
        codec.decode(VOTE_SET_BITS_CHANNEL, &bytes),
        Err(CodecError::InvalidMessage(MessageError::MalformedBitArray))
    ));
    reactor.receive(VOTE_SET_BITS_CHANNEL, peer.clone(), &bytes);
    assert_eq!(reactor.peer_state(&peer).unwrap(), peer_state);

    // 3.1. So is one larger than any validator set.
    let (_, bytes) = codec
        .encode(&vote_set_bits(0, BitArray::new(MAX_VOTES_COUNT + 1)))
        .unwrap();
    assert!(matches!(
        codec.decode(VOTE_SET_BITS_CHANNEL, &bytes),
        Err(CodecError::InvalidMessage(MessageError::BitArrayTooLarge { .. }))
    ));

    // 4. HasVote claims are only recorded for the peer's height, nearby rounds, and valid indices.
    log::debug!("Receiving out of range HasVote messages.");
    let (_, bytes) = codec.encode(&has_vote(1, 0, MAX_VOTES_COUNT as u32)).unwrap();
    assert!(matches!(
        codec.decode(STATE_CHANNEL, &bytes),
        Err(CodecError::InvalidMessage(MessageError::IndexOutOfRange { .. }))
    ));
    for (height, round) in [(2, 0), (1, 5), (1, 1000)] {
        let (channel, bytes) = codec.encode(&has_vote(height, round, 0)).unwrap();
        reactor.receive(channel, peer.clone(), &bytes);
        let peer_state = reactor.peer_state(&peer).unwrap();
        assert!(!peer_state.has_vote(Round::new(round), VoteType::Precommit, 0));
    }
    assert_eq!(reactor.peer_state(&peer).unwrap().votes.len(), 1);
    let (channel, bytes) = codec.encode(&has_vote(1, 1, 0)).unwrap();
    reactor.receive(channel, peer.clone(), &bytes);
    assert!(reactor
        .peer_state(&peer)
        .unwrap()
        .has_vote(Round::new(1), VoteType::Precommit, 0));

    // 5. Moving to a later round forgets the votes of rounds that are no longer nearby.
    log::debug!("Receiving NewRoundStep for round 3.");
    let (channel, bytes) = codec.encode(&new_round_step(1, 3, Step::Propose, None)).unwrap();
    reactor.receive(channel, peer.clone(), &bytes);
    let peer_state = reactor.peer_state(&peer).unwrap();
    assert!(!peer_state.has_vote(Round::new(0), VoteType::Prevote, 1));
    assert!(!peer_state.has_vote(Round::new(1), VoteType::Precommit, 0));
    assert!(peer_state.votes.is_empty());

    // 6. None of these reach the engine.
    assert!(input_receiver.try_recv().is_err());
}
