use log::LevelFilter;
use tendermint_rs::types::{
    basic::{ChainID, CryptoHash, Height, PeerID, Round},
    block::BlockID,
    part_set::PartSetHeader,
    vote::VoteType,
    vote_set::{VoteSet, VoteSetError},
};

mod common;

use crate::common::{
    logging::setup_logger,
    validators::{genesis, signed_vote, signing_keys, validator_index, CHAIN_ID},
};

fn block_id(seed: &[u8]) -> BlockID {
    BlockID::new(
        CryptoHash::digest(seed),
        PartSetHeader {
            total: 1,
            hash: CryptoHash::digest(&[seed, b"-parts"].concat()),
        },
    )
}

#[test]
fn vote_set_majority_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Create 4 validators with power 1 each. +2/3 of the voting power is 3 validators.
    let keys = signing_keys(4);
    let validators = genesis(&keys).validator_set().unwrap();
    let (height, round) = (Height::new(1), Round::new(0));
    let mut prevotes = VoteSet::new(
        ChainID::new(CHAIN_ID),
        height,
        round,
        VoteType::Prevote,
        validators.clone(),
    );
    let block_a = block_id(b"a");

    // 2. Add prevotes until there is a majority.

    // 2.1. Two prevotes for block A and one for nil are +2/3 of anything, but no majority.
    log::debug!("Adding 2 prevotes for block A and 1 prevote for nil.");
    for key in &keys[0..2] {
        let vote = signed_vote(key, &validators, VoteType::Prevote, height, round, Some(block_a));
        assert_eq!(prevotes.add_vote(vote).unwrap(), true);
    }
    let nil_vote = signed_vote(&keys[2], &validators, VoteType::Prevote, height, round, None);
    assert_eq!(prevotes.add_vote(nil_vote).unwrap(), true);
    assert!(prevotes.has_two_thirds_any());
    assert!(!prevotes.has_two_thirds_majority());
    assert_eq!(prevotes.two_thirds_majority(), None);

    // 2.2. A third prevote for block A completes the majority.
    log::debug!("Adding a third prevote for block A.");
    let vote = signed_vote(&keys[3], &validators, VoteType::Prevote, height, round, Some(block_a));
    assert_eq!(prevotes.add_vote(vote.clone()).unwrap(), true);
    assert_eq!(prevotes.two_thirds_majority(), Some(Some(block_a)));
    assert!(prevotes.has_all());
    assert_eq!(prevotes.bit_array().count_ones(), 4);

    // 2.3. Adding the same vote again is a no-op.
    assert_eq!(prevotes.add_vote(vote).unwrap(), false);

    // 3. Votes from the wrong step, or from non-validators, are rejected.
    log::debug!("Adding votes that do not belong in the set.");
    let precommit = signed_vote(&keys[0], &validators, VoteType::Precommit, height, round, Some(block_a));
    assert!(matches!(
        prevotes.add_vote(precommit),
        Err(VoteSetError::UnexpectedStep { .. })
    ));
    let mut bad_index = signed_vote(&keys[0], &validators, VoteType::Prevote, height, round, None);
    bad_index.validator_index = 7;
    assert!(matches!(
        prevotes.add_vote(bad_index),
        Err(VoteSetError::InvalidValidatorIndex { index: 7 })
    ));
}

#[test]
fn vote_set_conflicting_votes_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.
    let keys = signing_keys(4);
    let validators = genesis(&keys).validator_set().unwrap();
    let (height, round) = (Height::new(1), Round::new(0));
    let mut prevotes = VoteSet::new(
        ChainID::new(CHAIN_ID),
        height,
        round,
        VoteType::Prevote,
        validators.clone(),
    );
    let (block_a, block_b) = (block_id(b"a"), block_id(b"b"));
    let byzantine = &keys[0];
    let byzantine_index = validator_index(&validators, byzantine) as usize;

    // 2. Test a conflicting vote nobody vouched for.

    // 2.1. The byzantine validator prevotes for block A, then for block B.
    log::debug!("Adding conflicting prevotes from the same validator.");
    let vote_a = signed_vote(byzantine, &validators, VoteType::Prevote, height, round, Some(block_a));
    let vote_b = signed_vote(byzantine, &validators, VoteType::Prevote, height, round, Some(block_b));
    assert_eq!(prevotes.add_vote(vote_a.clone()).unwrap(), true);
    match prevotes.add_vote(vote_b.clone()) {
        Err(VoteSetError::ConflictingVotes {
            existing,
            conflicting,
            added,
        }) => {
            assert_eq!(existing, vote_a);
            assert_eq!(conflicting, vote_b);
            assert!(!added);
        }
        other => panic!("expected conflicting votes, got {:?}", other),
    }

    // 2.2. The first vote stays the validator's vote.
    assert_eq!(prevotes.get_by_index(byzantine_index), Some(&vote_a));

    // 3. Test a conflicting vote for a block a peer claims has a majority.

    // 3.1. A peer claims +2/3 for block B.
    log::debug!("Setting peer maj23 for block B.");
    let peer = PeerID::new("peer");
    prevotes.set_peer_maj23(peer.clone(), Some(block_b)).unwrap();

    // 3.2. The same peer may repeat its claim, but not change it.
    prevotes.set_peer_maj23(peer.clone(), Some(block_b)).unwrap();
    assert!(matches!(
        prevotes.set_peer_maj23(peer, Some(block_a)),
        Err(VoteSetError::ConflictingPeerMaj23 { .. })
    ));

    // 3.3. The conflicting vote for block B is now tallied.
    match prevotes.add_vote(vote_b) {
        Err(VoteSetError::ConflictingVotes { added, .. }) => assert!(added),
        other => panic!("expected conflicting votes, got {:?}", other),
    }

    // 3.4. Two more prevotes for block B give it a majority, even though the byzantine validator's
    // primary vote was for block A.
    log::debug!("Adding 2 more prevotes for block B.");
    for key in &keys[1..3] {
        let vote = signed_vote(key, &validators, VoteType::Prevote, height, round, Some(block_b));
        assert_eq!(prevotes.add_vote(vote).unwrap(), true);
    }
    assert_eq!(prevotes.two_thirds_majority(), Some(Some(block_b)));
    assert_eq!(
        prevotes.get_by_index(byzantine_index).unwrap().block_id,
        Some(block_b)
    );
    assert_eq!(
        prevotes
            .bit_array_by_block_id(&Some(block_b))
            .unwrap()
            .count_ones(),
        3
    );
}

#[test]
fn vote_set_make_commit_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.
    let keys = signing_keys(4);
    let validators = genesis(&keys).validator_set().unwrap();
    let (height, round) = (Height::new(3), Round::new(1));
    let chain_id = ChainID::new(CHAIN_ID);
    let block_a = block_id(b"a");

    // 2. A prevote set cannot make a commit.
    let prevotes = VoteSet::new(
        chain_id.clone(),
        height,
        round,
        VoteType::Prevote,
        validators.clone(),
    );
    assert!(matches!(
        prevotes.make_commit(),
        Err(VoteSetError::NotAPrecommitSet)
    ));

    // 3. A precommit set makes a commit only once it has a majority for a block.
    let mut precommits = VoteSet::new(
        chain_id.clone(),
        height,
        round,
        VoteType::Precommit,
        validators.clone(),
    );

    // 3.1. A majority for nil is not enough.
    log::debug!("Adding 3 precommits for nil.");
    for key in &keys[0..3] {
        let vote = signed_vote(key, &validators, VoteType::Precommit, height, round, None);
        precommits.add_vote(vote).unwrap();
    }
    assert!(precommits.is_commit());
    assert!(matches!(
        precommits.make_commit(),
        Err(VoteSetError::NoBlockMajority)
    ));

    // 3.2. A fresh set with 3 precommits for block A and 1 for nil.
    log::debug!("Adding 3 precommits for block A and 1 for nil.");
    let mut precommits = VoteSet::new(
        chain_id.clone(),
        height,
        round,
        VoteType::Precommit,
        validators.clone(),
    );
    for key in &keys[0..3] {
        let vote = signed_vote(key, &validators, VoteType::Precommit, height, round, Some(block_a));
        precommits.add_vote(vote).unwrap();
    }
    let nil_vote = signed_vote(&keys[3], &validators, VoteType::Precommit, height, round, None);
    precommits.add_vote(nil_vote).unwrap();

    // 3.3. The commit keeps every precommit, including the one for nil.
    let commit = precommits.make_commit().unwrap();
    assert_eq!(commit.block_id, block_a);
    assert_eq!(commit.height(), Some(height));
    assert_eq!(commit.round(), Some(round));
    assert_eq!(commit.precommits.iter().flatten().count(), 4);

    // 4. The precommit set can be rebuilt from the commit.
    let rebuilt = VoteSet::from_commit(chain_id, &commit, validators).unwrap();
    assert_eq!(rebuilt.two_thirds_majority(), Some(Some(block_a)));
    assert_eq!(rebuilt.bit_array(), precommits.bit_array());
}

#[test]
fn vote_set_quorum_boundary_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Test validator sets whose total power is divisible by 3. With total power P, exactly 2P/3 is not
    // enough, and 2P/3 + 1 is.
    for num_validators in [3u8, 6] {
        // 1.1. Initialize test components.
        let keys = signing_keys(num_validators);
        let validators = genesis(&keys).validator_set().unwrap();
        let (height, round) = (Height::new(1), Round::new(0));
        let mut precommits = VoteSet::new(
            ChainID::new(CHAIN_ID),
            height,
            round,
            VoteType::Precommit,
            validators.clone(),
        );
        let block_a = block_id(b"a");
        let two_thirds = num_validators as usize * 2 / 3;

        // 1.2. Add exactly 2P/3 precommits for block A.
        log::debug!("Adding {} of {} precommits for block A.", two_thirds, num_validators);
        for key in &keys[0..two_thirds] {
            let vote = signed_vote(key, &validators, VoteType::Precommit, height, round, Some(block_a));
            assert_eq!(precommits.add_vote(vote).unwrap(), true);
        }
        assert_eq!(precommits.two_thirds_majority(), None);
        assert!(!precommits.has_two_thirds_majority());
        assert!(!precommits.has_two_thirds_any());

        // 1.3. One more precommit crosses the threshold.
        log::debug!("Adding precommit {} for block A.", two_thirds + 1);
        let vote = signed_vote(
            &keys[two_thirds],
            &validators,
            VoteType::Precommit,
            height,
            round,
            Some(block_a),
        );
        assert_eq!(precommits.add_vote(vote).unwrap(), true);
        assert_eq!(precommits.two_thirds_majority(), Some(Some(block_a)));
        assert!(precommits.has_two_thirds_majority());
        assert!(precommits.has_two_thirds_any());
    }
}

#[test]
fn vote_set_conflicting_majorities_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.
    let keys = signing_keys(4);
    let validators = genesis(&keys).validator_set().unwrap();
    let (height, round) = (Height::new(1), Round::new(0));
    let mut prevotes = VoteSet::new(
        ChainID::new(CHAIN_ID),
        height,
        round,
        VoteType::Prevote,
        validators.clone(),
    );
    let (block_a, block_b) = (block_id(b"a"), block_id(b"b"));

    // 2. Validators 0, 1 and 2 give block A a majority.
    log::debug!("Adding 3 prevotes for block A.");
    let mut votes_for_a = Vec::new();
    for key in &keys[0..3] {
        let vote = signed_vote(key, &validators, VoteType::Prevote, height, round, Some(block_a));
        assert_eq!(prevotes.add_vote(vote.clone()).unwrap(), true);
        votes_for_a.push(vote);
    }
    assert_eq!(prevotes.two_thirds_majority(), Some(Some(block_a)));

    // 3. A peer claims +2/3 for block B, so conflicting votes for block B are tallied.
    prevotes.set_peer_maj23(PeerID::new("peer"), Some(block_b)).unwrap();

    // 3.1. Validator 3 prevotes for block B, and validator 1 double signs for it.
    log::debug!("Adding prevotes for block B from validators 3 and 1.");
    let vote = signed_vote(&keys[3], &validators, VoteType::Prevote, height, round, Some(block_b));
    assert_eq!(prevotes.add_vote(vote).unwrap(), true);
    let vote = signed_vote(&keys[1], &validators, VoteType::Prevote, height, round, Some(block_b));
    assert!(matches!(
        prevotes.add_vote(vote),
        Err(VoteSetError::ConflictingVotes { added: true, .. })
    ));

    // 3.2. Validator 2 double signs for block B too, completing a second majority. The error reports
    // both the second majority and the double sign.
    log::debug!("Adding a conflicting prevote for block B from validator 2.");
    let vote_b = signed_vote(&keys[2], &validators, VoteType::Prevote, height, round, Some(block_b));
    match prevotes.add_vote(vote_b.clone()) {
        Err(VoteSetError::ConflictingMajorities {
            first,
            second,
            evidence,
        }) => {
            assert_eq!(first, Some(block_a));
            assert_eq!(second, Some(block_b));
            assert_eq!(evidence, Some((votes_for_a[2].clone(), vote_b)));
        }
        other => panic!("expected conflicting majorities, got {:?}", other),
    }

    // 4. The first majority is kept, and the second one is recorded.
    assert_eq!(prevotes.two_thirds_majority(), Some(Some(block_a)));
    assert_eq!(prevotes.conflicting_majority(), Some(Some(block_b)));
}
