/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definition for the pool of pending transactions that proposers reap blocks from.

use std::sync::mpsc::{SyncSender, TrySendError};

use crate::{
    app::DeliverTxResponse,
    consensus::messages::ConsensusInput,
    types::basic::{Height, Tx},
};

pub trait Mempool: Send {
    /// Called before the block executor commits a block. Until [unlock](Mempool::unlock) is called the
    /// mempool must not run transactions against the application.
    fn lock(&mut self);

    fn unlock(&mut self);

    fn size(&self) -> usize;

    /// Return pending transactions, in order, whose total size is at most `max_bytes` and whose total gas
    /// is at most `max_gas` (negative `max_gas` means no limit).
    fn reap_max_bytes_max_gas(&self, max_bytes: u64, max_gas: i64) -> Vec<Tx>;

    /// Remove the transactions committed in block `height`. Called with the mempool locked.
    fn update(
        &mut self,
        height: Height,
        txs: &[Tx],
        responses: &[DeliverTxResponse],
    ) -> Result<(), MempoolError>;

    /// Register `notifier`, which the mempool should [notify](TxsAvailableNotifier::notify) once per
    /// height when it becomes non-empty.
    fn enable_txs_available(&mut self, notifier: TxsAvailableNotifier);
}

/// Handle that pushes a [ConsensusInput::TxsAvailable] into the consensus engine's input queue.
#[derive(Clone)]
pub struct TxsAvailableNotifier {
    sender: SyncSender<ConsensusInput>,
}

impl TxsAvailableNotifier {
    pub(crate) fn new(sender: SyncSender<ConsensusInput>) -> TxsAvailableNotifier {
        TxsAvailableNotifier { sender }
    }

    /// Never blocks: if the engine's queue is full, the engine is busy and will reap the mempool anyway.
    pub fn notify(&self) {
        match self.sender.try_send(ConsensusInput::TxsAvailable) {
            Ok(()) | Err(TrySendError::Full(_)) => (),
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("TxsAvailable dropped: consensus engine stopped")
            }
        }
    }
}

/// A mempool that never has transactions. Used when blocks are re-applied during replay, where the real
/// mempool must not be touched.
pub struct EmptyMempool;

impl Mempool for EmptyMempool {
    fn lock(&mut self) {}

    fn unlock(&mut self) {}

    fn size(&self) -> usize {
        0
    }

    fn reap_max_bytes_max_gas(&self, _: u64, _: i64) -> Vec<Tx> {
        Vec::new()
    }

    fn update(&mut self, _: Height, _: &[Tx], _: &[DeliverTxResponse]) -> Result<(), MempoolError> {
        Ok(())
    }

    fn enable_txs_available(&mut self, _: TxsAvailableNotifier) {}
}

#[derive(Debug)]
pub enum MempoolError {
    Update(String),
}
