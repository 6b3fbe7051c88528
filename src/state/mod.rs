//! The replicated state that the engine advances block by block, its persistence, and the executor that
//! applies committed blocks to the application.

pub mod execution;

pub mod state;

pub mod store;

pub use execution::{BlockExecutionError, BlockExecutor, InvalidBlockError};
pub use state::{median_time, State, ValidatorsInfo};
pub use store::{StateStore, StateStoreError};
