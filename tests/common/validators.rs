//! Deterministic validator keys, and helpers for signing consensus messages on behalf of validators
//! that are not backed by a node.

use ed25519_dalek::Signer;
use tendermint_rs::types::{
    basic::{AppHash, ChainID, Height, PeerID, Power, Round, SignatureBytes, Timestamp},
    block::BlockID,
    crypto::{PublicKeyBytes, SigningKey},
    genesis::{GenesisDoc, GenesisValidator},
    params::ConsensusParams,
    validators::ValidatorSet,
    vote::{Vote, VoteType},
};

pub(crate) const CHAIN_ID: &str = "test-chain";

/// `n` signing keys that are the same on every run.
pub(crate) fn signing_keys(n: u8) -> Vec<SigningKey> {
    (1..=n).map(|i| SigningKey::from_bytes(&[i; 32])).collect()
}

pub(crate) fn pub_key(signing_key: &SigningKey) -> PublicKeyBytes {
    PublicKeyBytes::from(&signing_key.verifying_key())
}

/// The peer ID a test gives the node holding `signing_key`.
pub(crate) fn peer_id(signing_key: &SigningKey) -> PeerID {
    PeerID::new(pub_key(signing_key).address().to_string())
}

/// A genesis document in which every key in `signing_keys` is a validator with power 1.
pub(crate) fn genesis(signing_keys: &[SigningKey]) -> GenesisDoc {
    GenesisDoc {
        genesis_time: Timestamp::now(),
        chain_id: ChainID::new(CHAIN_ID),
        consensus_params: ConsensusParams::default(),
        validators: signing_keys
            .iter()
            .enumerate()
            .map(|(i, signing_key)| GenesisValidator {
                pub_key: pub_key(signing_key),
                power: Power::new(1),
                name: format!("validator-{}", i),
            })
            .collect(),
        app_hash: AppHash::new(vec![]),
        app_state: vec![],
    }
}

/// The position of `signing_key` in `validators`, which are sorted by address rather than in the order
/// the keys were created in.
pub(crate) fn validator_index(validators: &ValidatorSet, signing_key: &SigningKey) -> u32 {
    validators
        .get_by_address(&pub_key(signing_key).address())
        .map(|(index, _)| index as u32)
        .expect("signing key is not a validator")
}

/// The key in `signing_keys` that belongs to the current proposer of `validators`.
pub(crate) fn proposer_key<'a>(
    validators: &ValidatorSet,
    signing_keys: &'a [SigningKey],
) -> &'a SigningKey {
    let proposer = validators.get_proposer().expect("empty validator set").address;
    signing_keys
        .iter()
        .find(|signing_key| pub_key(signing_key).address() == proposer)
        .expect("proposer is not one of the signing keys")
}

/// Sign a vote directly with `signing_key`, bypassing the double-sign protection of a
/// [`LocalSigner`](tendermint_rs::types::signer::LocalSigner).
pub(crate) fn signed_vote(
    signing_key: &SigningKey,
    validators: &ValidatorSet,
    vote_type: VoteType,
    height: Height,
    round: Round,
    block_id: Option<BlockID>,
) -> Vote {
    let mut vote = Vote {
        vote_type,
        height,
        round,
        block_id,
        timestamp: Timestamp::now(),
        validator_address: pub_key(signing_key).address(),
        validator_index: validator_index(validators, signing_key),
        signature: SignatureBytes::empty(),
    };
    let sign_bytes = vote.sign_bytes(&ChainID::new(CHAIN_ID));
    vote.signature = SignatureBytes::new(signing_key.sign(&sign_bytes).to_bytes());
    vote
}
