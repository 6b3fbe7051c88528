use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use tendermint_rs::{networking::{ChannelID, Network}, types::basic::PeerID};

type Frame = (PeerID, ChannelID, Vec<u8>);

/// A mock network stub which passes frames from and to threads using channels.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_peer_id: PeerID,
    all_peers: HashMap<PeerID, Sender<Frame>>,
    inbox: Arc<Mutex<Receiver<Frame>>>,
}

impl Network for NetworkStub {
    fn broadcast(&mut self, channel: ChannelID, bytes: Vec<u8>) {
        for (peer, sender) in &self.all_peers {
            if *peer != self.my_peer_id {
                let _ = sender.send((self.my_peer_id.clone(), channel, bytes.clone()));
            }
        }
    }

    fn send(&mut self, peer: PeerID, channel: ChannelID, bytes: Vec<u8>) {
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send((self.my_peer_id.clone(), channel, bytes));
        }
    }

    fn recv(&mut self) -> Option<Frame> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = PeerID>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(PeerID, Receiver<Frame>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer.clone(), sender);

            (peer, receiver)
        })
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(my_peer_id, inbox)| NetworkStub {
            my_peer_id,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}
