//! The round engine and the components that feed it.
//!
//! The [engine](state::ConsensusState) consumes a single queue of inputs: messages decoded by the
//! [reactor](reactor::ConsensusReactor), timeouts fired by the [ticker](ticker::TimeoutTicker), and
//! mempool notifications. [Replay](replay) brings the application and the stores back in sync on
//! startup.

pub mod codec;

pub mod height_vote_set;

pub mod messages;

pub mod reactor;

pub mod replay;

pub mod round_state;

pub mod state;

pub mod ticker;
