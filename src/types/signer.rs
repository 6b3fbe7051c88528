/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signing of votes and proposals, with protection against double-signing.
//!
//! A [PrivValidator] remembers the last `(height, round, step)` it signed at. It refuses to sign at a
//! lower step, and refuses to sign a *different* message at the same step. If asked to re-sign the same
//! message (possibly with a different timestamp, as happens when a height is replayed after a crash), it
//! returns the signature it produced the first time, adjusting the message's timestamp to match.

use ed25519_dalek::{Signer, SigningKey};

use super::{
    basic::{Address, ChainID, Height, Round, SignatureBytes},
    crypto::PublicKeyBytes,
    proposal::Proposal,
    vote::{Vote, VoteType},
};

/// Signs votes and proposals on behalf of a validator.
pub trait PrivValidator: Send {
    fn pub_key(&self) -> PublicKeyBytes;

    fn address(&self) -> Address {
        self.pub_key().address()
    }

    /// Set `vote.signature`, possibly also resetting `vote.timestamp` to that of an identical vote
    /// signed earlier.
    fn sign_vote(&mut self, chain_id: &ChainID, vote: &mut Vote) -> Result<(), SignerError>;

    /// Set `proposal.signature`, possibly also resetting `proposal.timestamp` to that of an identical
    /// proposal signed earlier.
    fn sign_proposal(
        &mut self,
        chain_id: &ChainID,
        proposal: &mut Proposal,
    ) -> Result<(), SignerError>;
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum SignStep {
    Propose = 1,
    Prevote = 2,
    Precommit = 3,
}

impl From<VoteType> for SignStep {
    fn from(vote_type: VoteType) -> Self {
        match vote_type {
            VoteType::Prevote => SignStep::Prevote,
            VoteType::Precommit => SignStep::Precommit,
        }
    }
}

enum Signed {
    Vote(Vote),
    Proposal(Proposal),
}

struct LastSignState {
    height: Height,
    round: Round,
    step: SignStep,
    signed: Signed,
}

/// A [PrivValidator] holding its Ed25519 signing key in memory.
pub struct LocalSigner {
    signing_key: SigningKey,
    last_sign_state: Option<LastSignState>,
}

impl LocalSigner {
    pub fn new(signing_key: SigningKey) -> LocalSigner {
        LocalSigner {
            signing_key,
            last_sign_state: None,
        }
    }

    fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.signing_key.sign(message).to_bytes())
    }

    /// Returns the last signed message if it was signed at exactly `(height, round, step)`, and an error
    /// if `(height, round, step)` is lower than the last signed step.
    fn check_hrs(
        &self,
        height: Height,
        round: Round,
        step: SignStep,
    ) -> Result<Option<&Signed>, SignerError> {
        let last = match &self.last_sign_state {
            Some(last) => last,
            None => return Ok(None),
        };
        if (height, round, step) < (last.height, last.round, last.step) {
            return Err(SignerError::Regression {
                last: (last.height, last.round),
                requested: (height, round),
            });
        }
        if (height, round, step) == (last.height, last.round, last.step) {
            return Ok(Some(&last.signed));
        }
        Ok(None)
    }
}

impl PrivValidator for LocalSigner {
    fn pub_key(&self) -> PublicKeyBytes {
        PublicKeyBytes::from(&self.signing_key.verifying_key())
    }

    fn sign_vote(&mut self, chain_id: &ChainID, vote: &mut Vote) -> Result<(), SignerError> {
        let step = SignStep::from(vote.vote_type);
        match self.check_hrs(vote.height, vote.round, step)? {
            Some(Signed::Vote(previous)) => {
                if previous.only_differs_by_timestamp(vote) {
                    vote.timestamp = previous.timestamp;
                    vote.signature = previous.signature;
                    return Ok(());
                }
                return Err(SignerError::ConflictingData);
            }
            Some(Signed::Proposal(_)) => return Err(SignerError::ConflictingData),
            None => (),
        }

        vote.signature = self.sign(&vote.sign_bytes(chain_id));
        self.last_sign_state = Some(LastSignState {
            height: vote.height,
            round: vote.round,
            step,
            signed: Signed::Vote(vote.clone()),
        });
        Ok(())
    }

    fn sign_proposal(
        &mut self,
        chain_id: &ChainID,
        proposal: &mut Proposal,
    ) -> Result<(), SignerError> {
        match self.check_hrs(proposal.height, proposal.round, SignStep::Propose)? {
            Some(Signed::Proposal(previous)) => {
                if previous.pol_round == proposal.pol_round
                    && previous.block_id == proposal.block_id
                {
                    proposal.timestamp = previous.timestamp;
                    proposal.signature = previous.signature;
                    return Ok(());
                }
                return Err(SignerError::ConflictingData);
            }
            Some(Signed::Vote(_)) => return Err(SignerError::ConflictingData),
            None => (),
        }

        proposal.signature = self.sign(&proposal.sign_bytes(chain_id));
        self.last_sign_state = Some(LastSignState {
            height: proposal.height,
            round: proposal.round,
            step: SignStep::Propose,
            signed: Signed::Proposal(proposal.clone()),
        });
        Ok(())
    }
}

#[derive(Debug)]
pub enum SignerError {
    /// Asked to sign at a step lower than one already signed at.
    Regression {
        last: (Height, Round),
        requested: (Height, Round),
    },
    /// Asked to sign a different message at a step already signed at.
    ConflictingData,
}
