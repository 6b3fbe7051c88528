use log::LevelFilter;
use tendermint_rs::{
    consensus::height_vote_set::{HeightVoteSet, MAX_CATCHUP_ROUNDS_PER_PEER},
    types::{
        basic::{ChainID, CryptoHash, Height, PeerID, Round},
        block::BlockID,
        part_set::PartSetHeader,
        vote::VoteType,
        vote_set::VoteSetError,
    },
};

mod common;

use crate::common::{
    logging::setup_logger,
    validators::{genesis, signed_vote, signing_keys, CHAIN_ID},
};

#[test]
fn height_vote_set_catchup_rounds_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.
    let keys = signing_keys(4);
    let validators = genesis(&keys).validator_set().unwrap();
    let height = Height::new(1);
    let mut votes = HeightVoteSet::new(ChainID::new(CHAIN_ID), height, validators.clone());
    let peer = PeerID::new("peer");

    // 2. Only round 0 is tracked from the start.
    assert!(votes.prevotes(Round::new(0)).is_some());
    assert!(votes.precommits(Round::new(0)).is_some());
    assert!(votes.prevotes(Round::new(5)).is_none());

    // 3. A peer may introduce a limited number of rounds.

    // 3.1. Votes for untracked rounds 5 and 6 start tracking those rounds.
    log::debug!("Adding votes for {} untracked rounds.", MAX_CATCHUP_ROUNDS_PER_PEER);
    for round in [5, 6] {
        let vote = signed_vote(&keys[0], &validators, VoteType::Prevote, height, Round::new(round), None);
        assert_eq!(votes.add_vote(vote, Some(&peer)).unwrap(), true);
        assert!(votes.prevotes(Round::new(round)).is_some());
    }

    // 3.2. A third untracked round from the same peer is refused.
    log::debug!("Adding a vote for one untracked round too many.");
    let vote = signed_vote(&keys[0], &validators, VoteType::Prevote, height, Round::new(7), None);
    assert!(matches!(
        votes.add_vote(vote.clone(), Some(&peer)),
        Err(VoteSetError::GotVoteFromUnwantedRound { .. })
    ));
    assert!(votes.prevotes(Round::new(7)).is_none());

    // 3.3. Another peer still has its own allowance.
    let other_peer = PeerID::new("other-peer");
    assert_eq!(votes.add_vote(vote, Some(&other_peer)).unwrap(), true);

    // 3.4. Votes for tracked rounds are never refused.
    let vote = signed_vote(&keys[1], &validators, VoteType::Precommit, height, Round::new(5), None);
    assert_eq!(votes.add_vote(vote, Some(&peer)).unwrap(), true);

    // 4. Own votes, and votes replayed from the WAL, may introduce any number of rounds.
    log::debug!("Adding own votes for untracked rounds 10 to 13.");
    for round in 10..=13 {
        let vote = signed_vote(&keys[2], &validators, VoteType::Prevote, height, Round::new(round), None);
        assert_eq!(votes.add_vote(vote, None).unwrap(), true);
        assert!(votes.prevotes(Round::new(round)).is_some());
    }

    // 4.1. They do not use up any peer's allowance either.
    let vote = signed_vote(&keys[3], &validators, VoteType::Prevote, height, Round::new(20), None);
    assert_eq!(votes.add_vote(vote, Some(&PeerID::new("third-peer"))).unwrap(), true);
}

#[test]
fn height_vote_set_set_round_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.
    let keys = signing_keys(4);
    let validators = genesis(&keys).validator_set().unwrap();
    let mut votes = HeightVoteSet::new(ChainID::new(CHAIN_ID), Height::new(1), validators);

    // 2. Moving the round forward tracks every round up to it.
    log::debug!("Setting the round to 3.");
    votes.set_round(Round::new(3)).unwrap();
    assert_eq!(votes.round(), Round::new(3));
    for round in 0..=3 {
        assert!(votes.prevotes(Round::new(round)).is_some());
    }

    // 3. The round may not go back by more than one.
    log::debug!("Setting the round back to 1.");
    assert!(matches!(
        votes.set_round(Round::new(1)),
        Err(VoteSetError::NonIncreasingRound { .. })
    ));
    votes.set_round(Round::new(2)).unwrap();
}

#[test]
fn height_vote_set_pol_info_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.
    let keys = signing_keys(4);
    let validators = genesis(&keys).validator_set().unwrap();
    let height = Height::new(1);
    let mut votes = HeightVoteSet::new(ChainID::new(CHAIN_ID), height, validators.clone());
    votes.set_round(Round::new(2)).unwrap();
    let block_id = BlockID::new(
        CryptoHash::digest(b"block"),
        PartSetHeader {
            total: 1,
            hash: CryptoHash::digest(b"parts"),
        },
    );

    // 2. No polka yet.
    assert_eq!(votes.pol_info(), None);

    // 3. A polka for nil in round 1 is not a POL.
    log::debug!("Adding a polka for nil in round 1.");
    for key in &keys[0..3] {
        let vote = signed_vote(key, &validators, VoteType::Prevote, height, Round::new(1), None);
        votes.add_vote(vote, None).unwrap();
    }
    assert_eq!(votes.pol_info(), None);

    // 4. A polka for a block in round 0 is.
    log::debug!("Adding a polka for a block in round 0.");
    for key in &keys[1..4] {
        let vote = signed_vote(key, &validators, VoteType::Prevote, height, Round::new(0), Some(block_id));
        votes.add_vote(vote, None).unwrap();
    }
    assert_eq!(votes.pol_info(), Some((Round::new(0), block_id)));

    // 5. A peer claim for a tracked round is recorded; one for an untracked round is ignored.
    let peer = PeerID::new("peer");
    votes
        .set_peer_maj23(Round::new(2), VoteType::Prevote, peer.clone(), Some(block_id))
        .unwrap();
    votes
        .set_peer_maj23(Round::new(9), VoteType::Prevote, peer, Some(block_id))
        .unwrap();
    assert!(votes.prevotes(Round::new(9)).is_none());
}
