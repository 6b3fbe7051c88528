//! [`KVApp`], a simple implementation of [`AppConn`] used in the integration tests.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use borsh::BorshSerialize;
use tendermint_rs::{
    app::{
        AppConn, AppConnError, BeginBlockRequest, CommitResponse, DeliverTxResponse,
        EndBlockRequest, EndBlockResponse, InfoResponse, InitChainRequest, InitChainResponse,
    },
    types::basic::{AppHash, CryptoHash, Height, Tx},
};

/// A key-value store application. Transactions of the form `key=value` set `key` to `value`; any other
/// transaction sets itself to itself.
///
/// Clones share the same state, so a test can keep a handle on the application it hands to a node and
/// inspect what the node did to it.
#[derive(Clone)]
pub(crate) struct KVApp(Arc<Mutex<KVAppState>>);

#[derive(Clone, Default)]
struct KVAppState {
    last_block_height: Height,
    last_block_app_hash: AppHash,
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    pending: BTreeMap<Vec<u8>, Vec<u8>>,
    pending_height: Height,
    init_chain_calls: usize,
}

impl KVApp {
    /// Create an application at height 0, with an empty app hash.
    pub(crate) fn new() -> KVApp {
        KVApp(Arc::new(Mutex::new(KVAppState::default())))
    }

    /// Create an application that starts out with a copy of this one's state, but does not share it.
    pub(crate) fn fork(&self) -> KVApp {
        KVApp(Arc::new(Mutex::new(self.0.lock().unwrap().clone())))
    }

    pub(crate) fn height(&self) -> Height {
        self.0.lock().unwrap().last_block_height
    }

    pub(crate) fn app_hash(&self) -> AppHash {
        self.0.lock().unwrap().last_block_app_hash.clone()
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().committed.get(key).cloned()
    }

    pub(crate) fn init_chain_calls(&self) -> usize {
        self.0.lock().unwrap().init_chain_calls
    }
}

impl AppConn for KVApp {
    fn info(&mut self) -> Result<InfoResponse, AppConnError> {
        let state = self.0.lock().unwrap();
        Ok(InfoResponse {
            last_block_height: state.last_block_height,
            last_block_app_hash: state.last_block_app_hash.clone(),
        })
    }

    fn init_chain(&mut self, _: InitChainRequest) -> Result<InitChainResponse, AppConnError> {
        self.0.lock().unwrap().init_chain_calls += 1;
        Ok(InitChainResponse::default())
    }

    fn begin_block(&mut self, request: BeginBlockRequest) -> Result<(), AppConnError> {
        let mut state = self.0.lock().unwrap();
        if request.header.height != state.last_block_height.next() {
            return Err(AppConnError::UnexpectedResponse(format!(
                "expected block {}, got block {}",
                state.last_block_height.next(),
                request.header.height
            )));
        }
        state.pending = state.committed.clone();
        state.pending_height = request.header.height;
        Ok(())
    }

    fn deliver_tx(&mut self, tx: &Tx) -> Result<DeliverTxResponse, AppConnError> {
        let (key, value) = match tx.bytes().iter().position(|byte| *byte == b'=') {
            Some(split) => (tx.bytes()[..split].to_vec(), tx.bytes()[split + 1..].to_vec()),
            None => (tx.bytes().to_vec(), tx.bytes().to_vec()),
        };
        self.0.lock().unwrap().pending.insert(key, value);
        Ok(DeliverTxResponse::default())
    }

    fn end_block(&mut self, _: EndBlockRequest) -> Result<EndBlockResponse, AppConnError> {
        Ok(EndBlockResponse::default())
    }

    fn commit(&mut self) -> Result<CommitResponse, AppConnError> {
        let mut state = self.0.lock().unwrap();
        state.committed = std::mem::take(&mut state.pending);
        state.last_block_height = state.pending_height;

        let bytes = (state.last_block_height.int(), &state.committed)
            .try_to_vec()
            .unwrap();
        state.last_block_app_hash = AppHash::new(CryptoHash::digest(&bytes).bytes().to_vec());
        Ok(CommitResponse {
            data: state.last_block_app_hash.clone(),
        })
    }
}
