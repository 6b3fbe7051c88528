use std::sync::{Arc, Mutex};

use tendermint_rs::{
    consensus::{messages::TimeoutInfo, ticker::TimeoutScheduler},
    service::{Service, ServiceError},
    types::basic::Step,
};

/// A [`TimeoutScheduler`] that never fires anything by itself. Tests read the timeouts the engine
/// scheduled and feed them back into the engine when they see fit.
#[derive(Clone)]
pub(crate) struct ManualScheduler(Arc<Mutex<Vec<TimeoutInfo>>>);

impl ManualScheduler {
    pub(crate) fn new() -> ManualScheduler {
        ManualScheduler(Arc::new(Mutex::new(Vec::new())))
    }

    /// The most recently scheduled timeout for `step`.
    pub(crate) fn last(&self, step: Step) -> TimeoutInfo {
        self.0
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|timeout_info| timeout_info.step == step)
            .cloned()
            .unwrap_or_else(|| panic!("no {} timeout was scheduled", step))
    }

    pub(crate) fn scheduled(&self) -> Vec<TimeoutInfo> {
        self.0.lock().unwrap().clone()
    }
}

impl TimeoutScheduler for ManualScheduler {
    fn schedule_timeout(&mut self, timeout_info: TimeoutInfo) {
        self.0.lock().unwrap().push(timeout_info);
    }
}

impl Service for ManualScheduler {
    fn start(&mut self) -> Result<(), ServiceError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        Ok(())
    }

    fn wait(&mut self) {}
}
