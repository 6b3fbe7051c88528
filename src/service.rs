/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Lifecycle of the long-running components of a node: the WAL, the timeout ticker, and the consensus
//! engine.

use std::fmt::{self, Display, Formatter};

pub trait Service {
    /// Start the service's background threads. Fails with [ServiceError::AlreadyStarted] if the service
    /// was started before.
    fn start(&mut self) -> Result<(), ServiceError>;

    /// Signal the service's threads to stop, wait for them to exit, and release the service's
    /// resources.
    fn stop(&mut self) -> Result<(), ServiceError>;

    /// Block until the service's threads have exited.
    fn wait(&mut self);
}

#[derive(Debug)]
pub enum ServiceError {
    AlreadyStarted,
    NotStarted,
    Failed(String),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::AlreadyStarted => f.write_str("service already started"),
            ServiceError::NotStarted => f.write_str("service not started"),
            ServiceError::Failed(reason) => write!(f, "service failed: {}", reason),
        }
    }
}
