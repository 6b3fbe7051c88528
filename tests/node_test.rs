use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use log::LevelFilter;
use rand_core::OsRng;
use tendermint_rs::{
    config::ConsensusConfig,
    node::{Node, NodeConfiguration, NodeSpec},
    types::{
        basic::{Height, PeerID, Tx},
        crypto::SigningKey,
        signer::LocalSigner,
    },
};

mod common;

use crate::common::{
    kv_app::KVApp,
    logging::setup_logger,
    mem_db::MemDB,
    mempool::TxQueue,
    network::{mock_network, NetworkStub},
    validators::{genesis, peer_id},
};

const FULL_NODE: &str = "full-node";

fn wait_until(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {}", what);
        thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn validators_and_full_node_commit_blocks_test() {
    setup_logger(LevelFilter::Info);

    // 1. Initialize test components.

    // 1.1. Prepare 4 validators with random keys, and a full node.
    let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
    let genesis = genesis(&keys);
    let peers: Vec<PeerID> = keys
        .iter()
        .map(peer_id)
        .chain([PeerID::new(FULL_NODE)])
        .collect();
    let networks: Vec<NetworkStub> = mock_network(peers.iter().cloned());

    // 1.2. Every node gets its own application, mempool, database, and WAL directory.
    let dir = tempfile::tempdir().unwrap();
    let apps: Vec<KVApp> = peers.iter().map(|_| KVApp::new()).collect();
    let mempools: Vec<TxQueue> = peers.iter().map(|_| TxQueue::new()).collect();
    let new_blocks: Arc<Mutex<HashSet<(usize, Height)>>> = Arc::new(Mutex::new(HashSet::new()));

    // 2. Start the nodes.
    log::debug!("Starting the nodes.");
    let nodes: Vec<Node<MemDB, NetworkStub>> = networks
        .into_iter()
        .enumerate()
        .map(|(i, network)| {
            let config = ConsensusConfig::builder()
                .timeout_propose(Duration::from_millis(1000))
                .timeout_prevote(Duration::from_millis(300))
                .timeout_precommit(Duration::from_millis(300))
                .timeout_commit(Duration::from_millis(100))
                .wal_path(dir.path().join(format!("node-{}", i)).join("cs.wal").join("wal"))
                .build();
            let configuration = NodeConfiguration::builder().log_events(i == 0).build();
            let new_blocks = new_blocks.clone();

            let spec = NodeSpec::builder()
                .app(apps[i].clone())
                .network(network)
                .kv_store(MemDB::new())
                .genesis(genesis.clone())
                .config(config)
                .configuration(configuration)
                .mempool(mempools[i].clone())
                .on_new_block(move |event| {
                    new_blocks.lock().unwrap().insert((i, event.block.height()));
                });
            match keys.get(i) {
                Some(key) => spec.priv_validator(LocalSigner::new(key.clone())).build().start(),
                None => spec.build().start(),
            }
        })
        .collect();

    // 3. Submit a transaction to a single validator. It is included once that validator proposes.
    mempools[0].submit(Tx::new(b"greeting=hello".to_vec()));

    // 4. Wait until every node, including the full node, has committed 5 blocks, one of which has the
    // transaction.
    log::debug!("Waiting for 5 blocks.");
    wait_until("every node commits 5 blocks", Duration::from_secs(120), || {
        apps.iter().all(|app| {
            app.height() >= Height::new(5) && app.get(b"greeting") == Some(b"hello".to_vec())
        })
    });
    assert!(nodes.iter().all(|node| node.is_running()));

    // 5. Every node's handler sees a NewBlock event for each block the node committed. Handlers run on
    // the event bus thread, so the last events may take a moment.
    wait_until("every node publishes 5 blocks", Duration::from_secs(10), || {
        let new_blocks = new_blocks.lock().unwrap();
        (0..peers.len()).all(|i| (1..=5).all(|height| new_blocks.contains(&(i, Height::new(height)))))
    });

    // 6. Nodes learn the round states of their peers.
    wait_until("node 0 sees peer 1 at height 5", Duration::from_secs(10), || {
        nodes[0]
            .peer_state(&peers[1])
            .map_or(false, |peer_state| peer_state.height >= Height::new(5))
    });
    assert!(nodes[0].round_state().unwrap().height >= Height::new(5));

    drop(nodes);

    // 7. Once stopped, every node has executed the same blocks.
    let min_height = apps.iter().map(|app| app.height()).min().unwrap();
    let app_hashes: Vec<_> = apps
        .iter()
        .filter(|app| app.height() == min_height)
        .map(|app| app.app_hash())
        .collect();
    assert!(app_hashes.windows(2).all(|pair| pair[0] == pair[1]));
}
