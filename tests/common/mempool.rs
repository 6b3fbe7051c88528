use std::sync::{Arc, Mutex};

use tendermint_rs::{
    app::DeliverTxResponse,
    mempool::{Mempool, MempoolError, TxsAvailableNotifier},
    types::basic::{Height, Tx},
};

/// A FIFO mempool. Clones share the same queue, so that a test can submit transactions to a mempool
/// it has handed to a node.
#[derive(Clone)]
pub(crate) struct TxQueue(Arc<Mutex<TxQueueState>>);

#[derive(Default)]
struct TxQueueState {
    txs: Vec<Tx>,
    notifier: Option<TxsAvailableNotifier>,
    notified: bool,
}

impl TxQueue {
    pub(crate) fn new() -> TxQueue {
        TxQueue(Arc::new(Mutex::new(TxQueueState::default())))
    }

    pub(crate) fn submit(&self, tx: Tx) {
        let mut state = self.0.lock().unwrap();
        state.txs.push(tx);
        notify_once(&mut state);
    }
}

// Notify the engine at most once per height.
fn notify_once(state: &mut TxQueueState) {
    if state.notified || state.txs.is_empty() {
        return;
    }
    if let Some(notifier) = &state.notifier {
        notifier.notify();
        state.notified = true;
    }
}

impl Mempool for TxQueue {
    fn lock(&mut self) {}

    fn unlock(&mut self) {}

    fn size(&self) -> usize {
        self.0.lock().unwrap().txs.len()
    }

    fn reap_max_bytes_max_gas(&self, max_bytes: u64, _: i64) -> Vec<Tx> {
        let mut total_bytes = 0;
        self.0
            .lock()
            .unwrap()
            .txs
            .iter()
            .take_while(|tx| {
                total_bytes += tx.len() as u64;
                total_bytes <= max_bytes
            })
            .cloned()
            .collect()
    }

    fn update(
        &mut self,
        _: Height,
        txs: &[Tx],
        _: &[DeliverTxResponse],
    ) -> Result<(), MempoolError> {
        let mut state = self.0.lock().unwrap();
        state.txs.retain(|tx| !txs.contains(tx));
        state.notified = false;
        notify_once(&mut state);
        Ok(())
    }

    fn enable_txs_available(&mut self, notifier: TxsAvailableNotifier) {
        let mut state = self.0.lock().unwrap();
        state.notifier = Some(notifier);
        notify_once(&mut state);
    }
}
