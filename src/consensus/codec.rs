/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Encoding of [ConsensusMessage]s into the frames carried by the [Network](crate::networking::Network).
//!
//! A frame is the Borsh encoding of a single [ConsensusMessage], sent on the channel returned by
//! [MessageCodec::channel_for]. Each node constructs one [MessageCodec] at startup and hands it to its
//! [reactor](super::reactor::ConsensusReactor); there is no global message registry.
//!
//! |Channel|ID|Messages|
//! |---|---|---|
//! |State|`0x20`|NewRoundStep, NewValidBlock, HasVote, VoteSetMaj23|
//! |Data|`0x21`|Proposal, ProposalPOL, BlockPart|
//! |Vote|`0x22`|Vote|
//! |VoteSetBits|`0x23`|VoteSetBits|

use borsh::{BorshDeserialize, BorshSerialize};

use crate::networking::ChannelID;

use super::messages::{ConsensusMessage, MessageError};

pub const STATE_CHANNEL: ChannelID = 0x20;
pub const DATA_CHANNEL: ChannelID = 0x21;
pub const VOTE_CHANNEL: ChannelID = 0x22;
pub const VOTE_SET_BITS_CHANNEL: ChannelID = 0x23;

/// Largest frame a node will decode.
pub const MAX_MSG_SIZE_BYTES: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct MessageCodec {
    max_msg_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        MessageCodec::new(MAX_MSG_SIZE_BYTES)
    }
}

impl MessageCodec {
    pub fn new(max_msg_size: usize) -> MessageCodec {
        MessageCodec { max_msg_size }
    }

    pub fn channel_for(msg: &ConsensusMessage) -> ChannelID {
        match msg {
            ConsensusMessage::NewRoundStep(_)
            | ConsensusMessage::NewValidBlock(_)
            | ConsensusMessage::HasVote(_)
            | ConsensusMessage::VoteSetMaj23(_) => STATE_CHANNEL,
            ConsensusMessage::Proposal(_)
            | ConsensusMessage::ProposalPOL(_)
            | ConsensusMessage::BlockPart(_) => DATA_CHANNEL,
            ConsensusMessage::Vote(_) => VOTE_CHANNEL,
            ConsensusMessage::VoteSetBits(_) => VOTE_SET_BITS_CHANNEL,
        }
    }

    /// Encode `msg`, returning the channel to send it on along with the frame.
    pub fn encode(&self, msg: &ConsensusMessage) -> Result<(ChannelID, Vec<u8>), CodecError> {
        let bytes = msg.try_to_vec()?;
        if bytes.len() > self.max_msg_size {
            return Err(CodecError::MessageTooBig {
                size: bytes.len(),
                max: self.max_msg_size,
            });
        }
        Ok((MessageCodec::channel_for(msg), bytes))
    }

    /// Decode a frame received on `channel`. The message must belong on that channel and pass its
    /// stateless checks.
    pub fn decode(&self, channel: ChannelID, bytes: &[u8]) -> Result<ConsensusMessage, CodecError> {
        if bytes.len() > self.max_msg_size {
            return Err(CodecError::MessageTooBig {
                size: bytes.len(),
                max: self.max_msg_size,
            });
        }
        let msg = ConsensusMessage::try_from_slice(bytes)?;
        let expected = MessageCodec::channel_for(&msg);
        if expected != channel {
            return Err(CodecError::WrongChannel {
                msg: msg.name(),
                expected,
                actual: channel,
            });
        }
        msg.validate_basic()?;
        Ok(msg)
    }
}

#[derive(Debug)]
pub enum CodecError {
    MessageTooBig {
        size: usize,
        max: usize,
    },
    Borsh(std::io::Error),
    WrongChannel {
        msg: &'static str,
        expected: ChannelID,
        actual: ChannelID,
    },
    InvalidMessage(MessageError),
}

impl From<std::io::Error> for CodecError {
    fn from(value: std::io::Error) -> Self {
        CodecError::Borsh(value)
    }
}

impl From<MessageError> for CodecError {
    fn from(value: MessageError) -> Self {
        CodecError::InvalidMessage(value)
    }
}
