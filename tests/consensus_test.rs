use std::sync::mpsc;

use log::LevelFilter;
use tendermint_rs::{
    config::ConsensusConfig,
    consensus::messages::{
        BlockPartMessage, ConsensusInput, ConsensusMessage, MsgInfo, ProposalMessage, VoteMessage,
    },
    events::Event,
    store::{BlockStore, KVBlockStore},
    types::{
        basic::{ChainID, Height, Round, Step, Tx},
        block::{BlockID, Commit},
        crypto::SigningKey,
        proposal::Proposal,
        signer::{LocalSigner, PrivValidator},
        vote::{Vote, VoteType},
    },
    wal::NopWAL,
};

mod common;

use crate::common::{
    engine::{Engine, TestEngine},
    logging::setup_logger,
    validators::{genesis, peer_id, proposer_key, pub_key, signed_vote, signing_keys, CHAIN_ID},
};

// Feed a vote signed by `signing_key` into the engine as if it came from that validator's node.
fn receive_vote(engine: &mut Engine, signing_key: &SigningKey, vote: Vote) {
    let msg = ConsensusMessage::Vote(VoteMessage { vote });
    engine
        .process(ConsensusInput::Message(MsgInfo::from_peer(msg, peer_id(signing_key))))
        .unwrap();
}

// Sign and send the proposal of `proposer` for an empty block at height 1 and the given round, and return
// the ID of the block.
fn receive_proposal(engine: &mut Engine, proposer: &SigningKey, round: Round) -> BlockID {
    let (block, parts) = engine.state().make_block(
        Height::new(1),
        vec![],
        Commit::empty(),
        pub_key(proposer).address(),
    );
    let block_id = BlockID::new(block.hash(), parts.header());

    let mut proposal = Proposal::new(Height::new(1), round, None, block_id);
    LocalSigner::new(proposer.clone())
        .sign_proposal(&ChainID::new(CHAIN_ID), &mut proposal)
        .unwrap();
    let proposal_msg = ConsensusMessage::Proposal(ProposalMessage { proposal });
    engine
        .process(ConsensusInput::Message(MsgInfo::from_peer(proposal_msg, peer_id(proposer))))
        .unwrap();

    for index in 0..parts.total() as usize {
        let part_msg = ConsensusMessage::BlockPart(BlockPartMessage {
            height: Height::new(1),
            round,
            part: parts.get_part(index).unwrap().clone(),
        });
        engine
            .process(ConsensusInput::Message(MsgInfo::from_peer(part_msg, peer_id(proposer))))
            .unwrap();
    }
    block_id
}

// Give the engine the key of a validator that does not propose in round 0, and return that key's
// position in `keys`.
fn sign_as_non_proposer(engine: &mut Engine, keys: &[SigningKey]) -> usize {
    let proposer = pub_key(proposer_key(&engine.round_state().validators, keys)).address();
    let position = keys
        .iter()
        .position(|key| pub_key(key).address() != proposer)
        .unwrap();
    engine.set_priv_validator(Box::new(LocalSigner::new(keys[position].clone())));
    position
}

#[test]
fn single_validator_commits_blocks_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Prepare a validator set with a single validator.
    let keys = signing_keys(1);
    let genesis = genesis(&keys);

    // 1.2. Build the engine, and give it a transaction to include.
    let node = TestEngine::new();
    let mut engine = node.engine(
        &genesis,
        ConsensusConfig::default(),
        Some(&keys[0]),
        Box::new(NopWAL),
        None,
    );
    node.mempool.submit(Tx::new(b"greeting=hello".to_vec()));

    // 2. Start the engine. It schedules the start of height 1.
    log::debug!("Starting the engine.");
    engine.start().unwrap();
    assert_eq!(engine.round_state().height, Height::new(1));
    assert_eq!(engine.round_state().step, Step::NewHeight);

    // 3. Every time the wait for a new height is over, the validator decides a block on its own.
    for height in 1..=3 {
        log::debug!("Firing the NewHeight timeout of height {}.", height);
        let timeout_info = node.scheduler.last(Step::NewHeight);
        assert_eq!(timeout_info.height, Height::new(height));
        engine.process(ConsensusInput::Timeout(timeout_info)).unwrap();

        let snapshot = engine.round_state_snapshot().lock().unwrap().clone();
        assert_eq!(snapshot.height, Height::new(height + 1));
        assert_eq!(snapshot.step, Step::NewHeight);
        assert_eq!(snapshot.last_commit_round, Some(Round::new(0)));
    }

    // 4. The blocks are stored and applied.
    log::debug!("Checking the block store and the application.");
    let block_store = KVBlockStore::new(node.db.clone()).unwrap();
    assert_eq!(block_store.height(), Height::new(3));
    let first_block = block_store.load_block(Height::new(1)).unwrap().unwrap();
    assert_eq!(first_block.txs, vec![Tx::new(b"greeting=hello".to_vec())]);

    assert_eq!(node.app.height(), Height::new(3));
    assert_eq!(node.app.get(b"greeting"), Some(b"hello".to_vec()));
    assert_eq!(engine.state().app_hash, node.app.app_hash());

    engine.stop().unwrap();
}

#[test]
fn lock_and_commit_proposal_of_peer_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Prepare a validator set with 4 validators, one of which is the engine.
    let keys = signing_keys(4);
    let genesis = genesis(&keys);
    let node = TestEngine::new();
    let (event_publisher, event_subscriber) = mpsc::channel();
    let mut engine = node.engine(
        &genesis,
        ConsensusConfig::default(),
        None,
        Box::new(NopWAL),
        Some(event_publisher),
    );
    let own_position = sign_as_non_proposer(&mut engine, &keys);
    let validators = engine.round_state().validators.clone();
    let proposer = proposer_key(&validators, &keys).clone();
    let others: Vec<SigningKey> = keys
        .iter()
        .enumerate()
        .filter(|(position, _)| *position != own_position)
        .map(|(_, key)| key.clone())
        .collect();

    // 1.2. Start the engine, and enter round 0.
    engine.start().unwrap();
    engine
        .process(ConsensusInput::Timeout(node.scheduler.last(Step::NewHeight)))
        .unwrap();
    assert_eq!(engine.round_state().step, Step::Propose);

    // 2. Receive the proposal. Once all of its parts are in, the engine prevotes for it.
    log::debug!("Receiving the proposal.");
    let block_id = receive_proposal(&mut engine, &proposer, Round::new(0));
    assert_eq!(engine.round_state().step, Step::Prevote);
    assert!(engine.round_state().proposal_block.is_some());
    let own_prevote = engine
        .round_state()
        .votes
        .prevotes(Round::new(0))
        .unwrap()
        .get_by_address(&pub_key(&keys[own_position]).address())
        .cloned()
        .unwrap();
    assert_eq!(own_prevote.block_id, Some(block_id));

    // 3. A validator that equivocates is reported, and its second vote is not counted.
    log::debug!("Receiving conflicting prevotes.");
    let equivocator = &others[2];
    let prevote = |key: &SigningKey, block_id| {
        signed_vote(key, &validators, VoteType::Prevote, Height::new(1), Round::new(0), block_id)
    };
    receive_vote(&mut engine, equivocator, prevote(equivocator, None));
    receive_vote(&mut engine, equivocator, prevote(equivocator, Some(block_id)));
    let prevotes = engine.round_state().votes.prevotes(Round::new(0)).unwrap();
    assert_eq!(prevotes.bit_array().count_ones(), 2);
    assert!(!prevotes.has_two_thirds_any());

    // 4. +2/3 prevotes for anything start the prevote wait, and a polka for the proposal locks it.
    log::debug!("Receiving a polka for the proposal.");
    receive_vote(&mut engine, &others[0], prevote(&others[0], Some(block_id)));
    assert_eq!(engine.round_state().step, Step::PrevoteWait);
    assert_eq!(node.scheduler.last(Step::PrevoteWait).round, Round::new(0));

    receive_vote(&mut engine, &others[1], prevote(&others[1], Some(block_id)));
    assert_eq!(engine.round_state().step, Step::Precommit);
    assert_eq!(engine.round_state().locked_round, Some(Round::new(0)));
    assert!(engine
        .round_state()
        .locked_block
        .as_ref()
        .map_or(false, |block| block.hashes_to(&block_id.hash)));
    let own_precommit = engine
        .round_state()
        .votes
        .precommits(Round::new(0))
        .unwrap()
        .get_by_address(&pub_key(&keys[own_position]).address())
        .cloned()
        .unwrap();
    assert_eq!(own_precommit.block_id, Some(block_id));

    // 5. +2/3 precommits for the proposal commit it.
    log::debug!("Receiving precommits for the proposal.");
    for key in &others[..2] {
        let precommit = signed_vote(
            key,
            &validators,
            VoteType::Precommit,
            Height::new(1),
            Round::new(0),
            Some(block_id),
        );
        receive_vote(&mut engine, key, precommit);
    }
    assert_eq!(engine.round_state().height, Height::new(2));
    assert_eq!(engine.round_state().locked_block, None);
    assert_eq!(engine.state().last_block_id, Some(block_id));
    assert_eq!(KVBlockStore::new(node.db.clone()).unwrap().height(), Height::new(1));

    // 6. Check the events the engine published along the way.
    let events: Vec<Event> = event_subscriber.try_iter().collect();
    assert!(events.iter().any(|event| matches!(event, Event::ConflictingVotes(_))));
    assert!(events.iter().any(|event| matches!(event, Event::Polka(_))));
    assert!(events.iter().any(|event| matches!(event, Event::Lock(_))));
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::NewBlock(new_block) if new_block.block.hashes_to(&block_id.hash))));

    engine.stop().unwrap();
}

#[test]
fn nil_round_moves_to_next_round_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Prepare a validator set with 4 validators, one of which is the engine.
    let keys = signing_keys(4);
    let genesis = genesis(&keys);
    let node = TestEngine::new();
    let mut engine = node.engine(
        &genesis,
        ConsensusConfig::default(),
        None,
        Box::new(NopWAL),
        None,
    );
    let own_position = sign_as_non_proposer(&mut engine, &keys);
    let validators = engine.round_state().validators.clone();
    let round_0_proposer = proposer_key(&validators, &keys).clone();
    let others: Vec<SigningKey> = keys
        .iter()
        .enumerate()
        .filter(|(position, _)| *position != own_position)
        .map(|(_, key)| key.clone())
        .collect();

    // 1.2. Start the engine, and enter round 0.
    engine.start().unwrap();
    engine
        .process(ConsensusInput::Timeout(node.scheduler.last(Step::NewHeight)))
        .unwrap();

    // 2. No proposal arrives before the propose timeout: the engine prevotes nil.
    log::debug!("Firing the propose timeout.");
    let timeout_propose = node.scheduler.last(Step::Propose);
    assert_eq!(timeout_propose.round, Round::new(0));
    engine.process(ConsensusInput::Timeout(timeout_propose)).unwrap();
    assert_eq!(engine.round_state().step, Step::Prevote);

    // 3. +2/3 prevotes for nil: the engine precommits nil.
    log::debug!("Receiving nil prevotes.");
    for key in &others[..2] {
        let prevote = signed_vote(key, &validators, VoteType::Prevote, Height::new(1), Round::new(0), None);
        receive_vote(&mut engine, key, prevote);
    }
    assert_eq!(engine.round_state().step, Step::Precommit);
    let precommits = engine.round_state().votes.precommits(Round::new(0)).unwrap();
    assert_eq!(precommits.bit_array().count_ones(), 1);
    assert_eq!(precommits.two_thirds_majority(), None);

    // 4. +2/3 precommits for nil start the precommit wait, without changing the step.
    log::debug!("Receiving nil precommits.");
    for key in &others[..2] {
        let precommit = signed_vote(key, &validators, VoteType::Precommit, Height::new(1), Round::new(0), None);
        receive_vote(&mut engine, key, precommit);
    }
    assert_eq!(engine.round_state().step, Step::Precommit);
    assert!(engine.round_state().triggered_timeout_precommit);

    // 5. Once the wait is over, the engine moves on to round 1 of the same height.
    log::debug!("Firing the precommit wait timeout.");
    let timeout_precommit = node.scheduler.last(Step::PrecommitWait);
    assert_eq!(timeout_precommit.round, Round::new(0));
    engine.process(ConsensusInput::Timeout(timeout_precommit)).unwrap();
    assert_eq!(engine.round_state().height, Height::new(1));
    assert_eq!(engine.round_state().round, Round::new(1));
    assert!(!engine.round_state().triggered_timeout_precommit);

    // 5.1. The proposer has moved on by one step of the weighted round robin.
    let mut round_1_validators = validators.clone();
    round_1_validators.increment_proposer_priority(1);
    let round_1_proposer = proposer_key(&round_1_validators, &keys).clone();
    assert_ne!(pub_key(&round_1_proposer), pub_key(&round_0_proposer));
    assert_eq!(
        engine.round_state().validators.get_proposer().unwrap().address,
        pub_key(&round_1_proposer).address()
    );

    // 5.2. Only a proposal signed by the new proposer is accepted.
    if pub_key(&round_1_proposer) == pub_key(&keys[own_position]) {
        log::debug!("The engine proposes in round 1.");
        let proposal = engine.round_state().proposal.clone().unwrap();
        assert_eq!(proposal.round, Round::new(1));
    } else {
        log::debug!("Receiving round 1 proposals from the old and the new proposer.");
        receive_proposal(&mut engine, &round_0_proposer, Round::new(1));
        assert!(engine.round_state().proposal.is_none());
        let block_id = receive_proposal(&mut engine, &round_1_proposer, Round::new(1));
        let proposal = engine.round_state().proposal.clone().unwrap();
        assert_eq!(proposal.round, Round::new(1));
        assert_eq!(proposal.block_id, block_id);
    }

    // 6. A stale timeout from round 0 is ignored.
    engine
        .process(ConsensusInput::Timeout(node.scheduler.last(Step::NewHeight)))
        .unwrap();
    assert_eq!(engine.round_state().round, Round::new(1));

    engine.stop().unwrap();
}
