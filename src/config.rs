/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration of the consensus engine's timeouts, block production, and WAL location.
//!
//! A [ConsensusConfig] is built once, either with its [builder](ConsensusConfig::builder), or by
//! [loading](ConsensusConfig::load) a JSON file, and is read-only afterwards. Durations are written as
//! milliseconds in JSON files:
//!
//! ```json
//! {
//!     "timeout_propose": 3000,
//!     "timeout_commit": 1000,
//!     "skip_timeout_commit": false,
//!     "wal_path": "data/cs.wal/wal"
//! }
//! ```
//!
//! Fields missing from the file take their default values.

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::types::basic::Round;

#[derive(Clone, PartialEq, Eq, Debug, TypedBuilder, Serialize, Deserialize)]
#[serde(default)]
#[builder(builder_method(doc = "
    Create a builder for building a [ConsensusConfig]. Every field is optional, and takes the default
    listed in its setter's documentation if not set.
"))]
pub struct ConsensusConfig {
    #[builder(default = Duration::from_millis(3000), setter(doc = "How long to wait for a proposal in round 0. Default: 3s."))]
    #[serde(with = "millis")]
    pub timeout_propose: Duration,
    #[builder(default = Duration::from_millis(500), setter(doc = "How much longer to wait for a proposal in each subsequent round. Default: 500ms."))]
    #[serde(with = "millis")]
    pub timeout_propose_delta: Duration,
    #[builder(default = Duration::from_millis(1000), setter(doc = "How long to wait after receiving +2/3 prevotes for anything. Default: 1s."))]
    #[serde(with = "millis")]
    pub timeout_prevote: Duration,
    #[builder(default = Duration::from_millis(500), setter(doc = "Increment of the prevote timeout per round. Default: 500ms."))]
    #[serde(with = "millis")]
    pub timeout_prevote_delta: Duration,
    #[builder(default = Duration::from_millis(1000), setter(doc = "How long to wait after receiving +2/3 precommits for anything. Default: 1s."))]
    #[serde(with = "millis")]
    pub timeout_precommit: Duration,
    #[builder(default = Duration::from_millis(500), setter(doc = "Increment of the precommit timeout per round. Default: 500ms."))]
    #[serde(with = "millis")]
    pub timeout_precommit_delta: Duration,
    #[builder(default = Duration::from_millis(1000), setter(doc = "How long to wait after committing a block, before starting the next height. Default: 1s."))]
    #[serde(with = "millis")]
    pub timeout_commit: Duration,
    #[builder(default = false, setter(doc = "Start the next height as soon as all precommits are in, instead of waiting for `timeout_commit`. Default: false."))]
    pub skip_timeout_commit: bool,
    #[builder(default = true, setter(doc = "Propose blocks even when the mempool is empty. Default: true."))]
    pub create_empty_blocks: bool,
    #[builder(default = Duration::ZERO, setter(doc = "If non-zero, and `create_empty_blocks` is set, propose an empty block only after waiting this long for transactions. Default: 0."))]
    #[serde(with = "millis")]
    pub create_empty_blocks_interval: Duration,
    #[builder(default = PathBuf::from("data/cs.wal/wal"), setter(into, doc = "Path of the WAL's head file. Default: `data/cs.wal/wal`."))]
    pub wal_path: PathBuf,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig::builder().build()
    }
}

impl ConsensusConfig {
    /// Read a config from the JSON file at `path`, and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<ConsensusConfig, ConfigError> {
        let bytes = fs::read(path)?;
        let config: ConsensusConfig = serde_json::from_slice(&bytes)?;
        config.validate_basic()?;
        Ok(config)
    }

    pub fn validate_basic(&self) -> Result<(), ConfigError> {
        if self.timeout_propose.is_zero() {
            return Err(ConfigError::ZeroTimeout("timeout_propose"));
        }
        if self.timeout_prevote.is_zero() {
            return Err(ConfigError::ZeroTimeout("timeout_prevote"));
        }
        if self.timeout_precommit.is_zero() {
            return Err(ConfigError::ZeroTimeout("timeout_precommit"));
        }
        if self.wal_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyWALPath);
        }
        Ok(())
    }

    pub fn propose(&self, round: Round) -> Duration {
        self.timeout_propose + self.timeout_propose_delta * round.int()
    }

    pub fn prevote(&self, round: Round) -> Duration {
        self.timeout_prevote + self.timeout_prevote_delta * round.int()
    }

    pub fn precommit(&self, round: Round) -> Duration {
        self.timeout_precommit + self.timeout_precommit_delta * round.int()
    }

    pub fn commit(&self) -> Duration {
        self.timeout_commit
    }

    /// Whether the first round of a height should wait for transactions before proposing.
    pub fn wait_for_txs(&self) -> bool {
        !self.create_empty_blocks || !self.create_empty_blocks_interval.is_zero()
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Json(serde_json::Error),
    ZeroTimeout(&'static str),
    EmptyWALPath,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "cannot read config file: {}", err),
            ConfigError::Json(err) => write!(f, "invalid config file: {}", err),
            ConfigError::ZeroTimeout(field) => write!(f, "{} must be greater than 0", field),
            ConfigError::EmptyWALPath => f.write_str("wal_path must not be empty"),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        ConfigError::Json(value)
    }
}
