/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Display, Formatter};

use super::{
    basic::{ChainID, Height, Round, SignatureBytes, Timestamp},
    block::BlockID,
    crypto::PublicKeyBytes,
};

/// A proposer's signed claim that `block_id` should be decided at `(height, round)`.
///
/// `pol_round` is the round of the proof-of-lock (a +2/3 prevote majority) that justifies re-proposing
/// a block first proposed in an earlier round. It is `None` for a fresh block.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    pub pol_round: Option<Round>,
    pub block_id: BlockID,
    pub timestamp: Timestamp,
    pub signature: SignatureBytes,
}

impl Proposal {
    pub fn new(
        height: Height,
        round: Round,
        pol_round: Option<Round>,
        block_id: BlockID,
    ) -> Proposal {
        Proposal {
            height,
            round,
            pol_round,
            block_id,
            timestamp: Timestamp::now(),
            signature: SignatureBytes::empty(),
        }
    }

    pub fn sign_bytes(&self, chain_id: &ChainID) -> Vec<u8> {
        (
            chain_id.clone(),
            self.height,
            self.round,
            self.pol_round,
            self.block_id,
            self.timestamp,
        )
            .try_to_vec()
            .unwrap_or_default()
    }

    pub fn verify(&self, chain_id: &ChainID, proposer: &PublicKeyBytes) -> bool {
        proposer.verify(&self.sign_bytes(chain_id), &self.signature)
    }

    pub fn validate_basic(&self) -> Result<(), ProposalError> {
        if let Some(pol_round) = self.pol_round {
            if pol_round >= self.round {
                return Err(ProposalError::InvalidPOLRound {
                    round: self.round,
                    pol_round,
                });
            }
        }
        if self.block_id.parts_header.is_zero() {
            return Err(ProposalError::MalformedBlockID);
        }
        Ok(())
    }
}

impl Display for Proposal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let pol_round = match self.pol_round {
            Some(round) => round.to_string(),
            None => String::from("-"),
        };
        write!(
            f,
            "Proposal{{{}/{} ({}, {}) @{}}}",
            self.height, self.round, self.block_id, pol_round, self.timestamp
        )
    }
}

#[derive(Debug)]
pub enum ProposalError {
    InvalidPOLRound { round: Round, pol_round: Round },
    MalformedBlockID,
    WrongHeightOrRound,
    InvalidSignature,
}
