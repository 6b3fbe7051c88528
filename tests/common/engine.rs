//! [`TestEngine`], the pluggables a [`ConsensusState`] needs, kept together so that tests can inspect
//! them, and rebuild an engine on top of them after a simulated crash.

use std::sync::mpsc::Sender;

use tendermint_rs::{
    config::ConsensusConfig,
    consensus::state::{ConsensusState, ConsensusStateSpec},
    events::Event,
    state::{BlockExecutor, State, StateStore},
    store::KVBlockStore,
    types::{crypto::SigningKey, genesis::GenesisDoc, signer::LocalSigner},
    wal::WAL,
};

use crate::common::{
    kv_app::KVApp, mem_db::MemDB, mempool::TxQueue, network::NetworkStub,
    scheduler::ManualScheduler,
};

pub(crate) type Engine = ConsensusState<MemDB, NetworkStub>;

pub(crate) struct TestEngine {
    pub(crate) db: MemDB,
    pub(crate) app: KVApp,
    pub(crate) mempool: TxQueue,
    pub(crate) scheduler: ManualScheduler,
}

impl TestEngine {
    pub(crate) fn new() -> TestEngine {
        TestEngine {
            db: MemDB::new(),
            app: KVApp::new(),
            mempool: TxQueue::new(),
            scheduler: ManualScheduler::new(),
        }
    }

    /// Build an engine over this node's database, application, and mempool, which fires timeouts only
    /// when the test feeds them back from `self.scheduler`. The engine is not started.
    pub(crate) fn engine(
        &self,
        genesis: &GenesisDoc,
        config: ConsensusConfig,
        signing_key: Option<&SigningKey>,
        wal: Box<dyn WAL>,
        event_publisher: Option<Sender<Event>>,
    ) -> Engine {
        let (state, block_exec, block_store) = self.components(genesis, event_publisher.clone());
        let spec = ConsensusStateSpec::<MemDB, NetworkStub>::builder()
            .config(config)
            .state(state)
            .block_exec(block_exec)
            .block_store(Box::new(block_store))
            .wal(wal)
            .ticker(Box::new(self.scheduler.clone()))
            .event_publisher(event_publisher)
            .build();
        with_signer(ConsensusState::new(spec).unwrap(), signing_key)
    }

    /// Like [TestEngine::engine], but the engine broadcasts to its peers through `network`.
    pub(crate) fn networked_engine(
        &self,
        genesis: &GenesisDoc,
        config: ConsensusConfig,
        signing_key: Option<&SigningKey>,
        wal: Box<dyn WAL>,
        network: NetworkStub,
    ) -> Engine {
        let (state, block_exec, block_store) = self.components(genesis, None);
        let spec = ConsensusStateSpec::<MemDB, NetworkStub>::builder()
            .config(config)
            .state(state)
            .block_exec(block_exec)
            .block_store(Box::new(block_store))
            .network(network)
            .wal(wal)
            .ticker(Box::new(self.scheduler.clone()))
            .build();
        with_signer(ConsensusState::new(spec).unwrap(), signing_key)
    }

    fn components(
        &self,
        genesis: &GenesisDoc,
        event_publisher: Option<Sender<Event>>,
    ) -> (State, BlockExecutor<MemDB>, KVBlockStore<MemDB>) {
        let mut state_store = StateStore::new(self.db.clone());
        let state = state_store.load_state_from_db_or_genesis(genesis).unwrap();
        let block_store = KVBlockStore::new(self.db.clone()).unwrap();
        let block_exec = BlockExecutor::new(
            state_store,
            Box::new(self.app.clone()),
            Box::new(self.mempool.clone()),
            event_publisher,
        );
        (state, block_exec, block_store)
    }
}

fn with_signer(mut engine: Engine, signing_key: Option<&SigningKey>) -> Engine {
    if let Some(signing_key) = signing_key {
        engine.set_priv_validator(Box::new(LocalSigner::new(signing_key.clone())));
    }
    engine
}
