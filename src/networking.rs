/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Network) for pluggable peer-to-peer networking, and the poller thread that hands
//! inbound bytes to the [consensus reactor](crate::consensus::reactor::ConsensusReactor).
//!
//! The engine is agnostic to how peers are discovered and connected to. Networking providers move opaque,
//! already-encoded byte frames tagged with a one-byte channel ID; the engine's
//! [MessageCodec](crate::consensus::codec::MessageCodec) encodes and decodes them.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::consensus::reactor::ConsensusReactor;
use crate::types::basic::PeerID;

/// Identifies the stream a frame belongs to. See [crate::consensus::codec] for the channels used by the
/// engine.
pub type ChannelID = u8;

pub trait Network: Clone + Send {
    /// Send a frame to all peers without blocking.
    fn broadcast(&mut self, channel: ChannelID, bytes: Vec<u8>);

    /// Send a frame to the specified peer without blocking.
    fn send(&mut self, peer: PeerID, channel: ChannelID, bytes: Vec<u8>);

    /// Receive a frame from any peer. Returns immediately with a None if no frame is available now.
    fn recv(&mut self) -> Option<(PeerID, ChannelID, Vec<u8>)>;
}

/// Spawn the poller thread, which polls the Network for frames and passes them to `reactor`.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    mut reactor: ConsensusReactor,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some((origin, channel, bytes)) = network.recv() {
            reactor.receive(channel, origin, &bytes);
        } else {
            thread::yield_now()
        }
    })
}
