use std::{fs, path::PathBuf, time::Duration};

use log::LevelFilter;
use tendermint_rs::{
    config::{ConfigError, ConsensusConfig},
    types::basic::Round,
};

mod common;

use crate::common::logging::setup_logger;

#[test]
fn config_defaults_and_round_timeouts_test() {
    setup_logger(LevelFilter::Debug);

    // 1. The builder and Default agree.
    let config = ConsensusConfig::builder().build();
    assert_eq!(config, ConsensusConfig::default());
    assert_eq!(config.timeout_propose, Duration::from_millis(3000));
    assert_eq!(config.timeout_commit, Duration::from_millis(1000));
    assert!(!config.skip_timeout_commit);
    assert!(!config.wait_for_txs());
    assert_eq!(config.wal_path, PathBuf::from("data/cs.wal/wal"));
    config.validate_basic().unwrap();

    // 2. Timeouts grow linearly with the round.
    assert_eq!(config.propose(Round::new(0)), Duration::from_millis(3000));
    assert_eq!(config.propose(Round::new(2)), Duration::from_millis(4000));
    assert_eq!(config.prevote(Round::new(3)), Duration::from_millis(2500));
    assert_eq!(config.precommit(Round::new(1)), Duration::from_millis(1500));

    // 3. Waiting for transactions.
    let config = ConsensusConfig::builder().create_empty_blocks(false).build();
    assert!(config.wait_for_txs());
    let config = ConsensusConfig::builder()
        .create_empty_blocks_interval(Duration::from_secs(5))
        .build();
    assert!(config.wait_for_txs());
}

#[test]
fn config_load_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("consensus.json");

    // 2. Fields missing from the file take their default values.
    log::debug!("Loading a partial config.");
    fs::write(
        &path,
        r#"{"timeout_propose": 250, "skip_timeout_commit": true, "wal_path": "/tmp/node/wal"}"#,
    )
    .unwrap();
    let config = ConsensusConfig::load(&path).unwrap();
    assert_eq!(config.timeout_propose, Duration::from_millis(250));
    assert!(config.skip_timeout_commit);
    assert_eq!(config.wal_path, PathBuf::from("/tmp/node/wal"));
    assert_eq!(config.timeout_prevote, Duration::from_millis(1000));

    // 3. Loaded configs are validated.
    log::debug!("Loading invalid configs.");
    fs::write(&path, r#"{"timeout_precommit": 0}"#).unwrap();
    assert!(matches!(
        ConsensusConfig::load(&path),
        Err(ConfigError::ZeroTimeout("timeout_precommit"))
    ));
    fs::write(&path, r#"{"wal_path": ""}"#).unwrap();
    assert!(matches!(ConsensusConfig::load(&path), Err(ConfigError::EmptyWALPath)));
    fs::write(&path, "timeout_propose = 3000").unwrap();
    assert!(matches!(ConsensusConfig::load(&path), Err(ConfigError::Json(_))));
    assert!(matches!(
        ConsensusConfig::load(dir.path().join("missing.json")),
        Err(ConfigError::Io(_))
    ));
}
