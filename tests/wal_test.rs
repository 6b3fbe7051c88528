use std::{
    fs::{self, OpenOptions},
    io::{Cursor, Write},
    path::Path,
};

use log::LevelFilter;
use tendermint_rs::{
    consensus::messages::TimeoutInfo,
    types::basic::{Height, Round, Step},
    wal::{
        codec::{encode_meta, WALReader},
        BaseWAL, DataCorruptionError, MetaMessage, WALEntry, WALError, WALMessage, WALSearchMode,
        WALSearchOptions, WAL,
    },
};

mod common;

use crate::common::logging::setup_logger;

fn timeout(height: u64, round: u32) -> WALMessage {
    WALMessage::Timeout(TimeoutInfo {
        duration_ms: 1000,
        height: Height::new(height),
        round: Round::new(round),
        step: Step::Propose,
    })
}

// Write the marker of each height in `heights`, each followed by 3 timeouts for that height.
fn write_heights(wal: &mut BaseWAL, heights: impl Iterator<Item = u64>) {
    for height in heights {
        wal.write_meta_sync(MetaMessage {
            height: Height::new(height),
        })
        .unwrap();
        for round in 0..3 {
            wal.write(timeout(height, round)).unwrap();
        }
    }
    wal.flush_and_sync().unwrap();
}

// Replace one character in the middle of the `line_number`-th line of the file at `path`.
fn corrupt_line(path: &Path, line_number: usize) {
    let contents = fs::read(path).unwrap();
    let mut lines: Vec<Vec<u8>> = contents.split(|byte| *byte == b'\n').map(|line| line.to_vec()).collect();
    let line = &mut lines[line_number];
    line[10] = if line[10] == b'A' { b'B' } else { b'A' };
    fs::write(path, lines.join(&b'\n')).unwrap();
}

fn next_timeout_height(entry: Option<WALEntry>) -> u64 {
    match entry {
        Some(WALEntry::Timed(timed)) => match timed.msg {
            WALMessage::Timeout(timeout_info) => timeout_info.height.int(),
            other => panic!("expected a timeout, got {:?}", other),
        },
        other => panic!("expected a timed message, got {:?}", other),
    }
}

#[test]
fn wal_search_across_rotated_files_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Open a WAL whose head is rotated every few entries, and which is never pruned.
    let dir = tempfile::tempdir().unwrap();
    let mut wal = BaseWAL::open_with_limits(dir.path().join("cs.wal").join("wal"), 256, 0).unwrap();

    // 1.2. Write heights 1 to 10.
    log::debug!("Writing heights 1 to 10.");
    write_heights(&mut wal, 1..=10);
    let (min_index, max_index) = wal.file_indices().unwrap();
    assert_eq!(min_index, 0);
    assert!(max_index > 3, "expected the WAL to rotate, head index {}", max_index);

    // 2. Test finding every height, with both search modes.
    for mode in [WALSearchMode::Backwards, WALSearchMode::Binary] {
        let options = WALSearchOptions {
            mode,
            ignore_data_corruption_errors: false,
        };
        for height in 1..=10 {
            log::debug!("Searching for height {} with {:?}.", height, mode);
            let mut reader = wal
                .search_for_height(Height::new(height), &options)
                .unwrap()
                .unwrap_or_else(|| panic!("height {} not found", height));

            // 2.1. The reader is positioned right after the marker.
            for _ in 0..3 {
                assert_eq!(next_timeout_height(reader.decode().unwrap()), height);
            }

            // 2.2. And keeps reading past the end of the marker's file.
            match reader.decode().unwrap() {
                Some(WALEntry::Meta(meta)) => assert_eq!(meta.height, Height::new(height + 1)),
                None => assert_eq!(height, 10),
                other => panic!("expected the next marker, got {:?}", other),
            }
        }

        // 3. A height that was never written is not found.
        assert!(wal
            .search_for_height(Height::new(11), &options)
            .unwrap()
            .is_none());
    }
}

#[test]
fn wal_data_corruption_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Write heights 1 and 2 into a single file.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal");
    let mut wal = BaseWAL::open(&path).unwrap();
    write_heights(&mut wal, 1..=2);
    drop(wal);

    // 1.2. Corrupt the second timeout of height 1. The file's lines are:
    // marker 1, 3 timeouts, marker 2, 3 timeouts.
    corrupt_line(&path, 2);
    let mut wal = BaseWAL::open(&path).unwrap();

    // 2. Reading past the corrupt entry fails, but leaves the reader on the next entry.
    log::debug!("Reading height 1.");
    let options = WALSearchOptions::default();
    let mut reader = wal
        .search_for_height(Height::new(1), &options)
        .unwrap()
        .unwrap();
    assert_eq!(next_timeout_height(reader.decode().unwrap()), 1);
    match reader.decode() {
        Err(WALError::DataCorruption(DataCorruptionError::ChecksumMismatch { .. })) => (),
        other => panic!("expected a checksum mismatch, got {:?}", other),
    }
    assert_eq!(next_timeout_height(reader.decode().unwrap()), 1);

    // 3. Searching for height 2 has to read through the corrupt entry.

    // 3.1. By default, the search fails.
    log::debug!("Searching for height 2.");
    assert!(wal
        .search_for_height(Height::new(2), &options)
        .err()
        .map_or(false, |err| err.is_data_corruption()));

    // 3.2. Unless told to skip corrupt entries.
    let options = WALSearchOptions {
        ignore_data_corruption_errors: true,
        ..Default::default()
    };
    let mut reader = wal
        .search_for_height(Height::new(2), &options)
        .unwrap()
        .unwrap();
    assert_eq!(next_timeout_height(reader.decode().unwrap()), 2);
}

#[test]
fn wal_incomplete_last_line_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Write height 1.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal");
    let mut wal = BaseWAL::open(&path).unwrap();
    write_heights(&mut wal, 1..=1);
    drop(wal);

    // 1.2. Simulate a crash in the middle of a write.
    let mut head = OpenOptions::new().append(true).open(&path).unwrap();
    head.write_all(b"AAAAbbbbCCCC").unwrap();
    drop(head);

    // 2. The incomplete line reads as the end of the log.
    log::debug!("Reading height 1.");
    let mut wal = BaseWAL::open(&path).unwrap();
    let mut reader = wal
        .search_for_height(Height::new(1), &WALSearchOptions::default())
        .unwrap()
        .unwrap();
    for _ in 0..3 {
        assert_eq!(next_timeout_height(reader.decode().unwrap()), 1);
    }
    assert_eq!(reader.decode().unwrap(), None);
}

#[test]
fn wal_overlong_line_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components. A reader for messages of up to 16 bytes accepts lines of up to 28
    // bytes, newline included.
    let max_size = 16;
    let mut log = vec![b'A'; 1000];
    log.push(b'\n');
    log.extend(encode_meta(&MetaMessage { height: Height::new(1) }).unwrap());
    log.extend(vec![b'A'; 1000]);
    let mut reader = WALReader::new(Cursor::new(log), max_size);

    // 2. An overlong line is corrupt, and the reader moves past it without buffering all of it.
    log::debug!("Reading an overlong line.");
    match reader.decode() {
        Err(WALError::DataCorruption(DataCorruptionError::LineTooLong { max: 28 })) => (),
        other => panic!("expected an overlong line, got {:?}", other),
    }
    assert_eq!(
        reader.decode().unwrap(),
        Some(WALEntry::Meta(MetaMessage { height: Height::new(1) }))
    );

    // 3. An overlong line without a newline is corrupt too, rather than an incomplete last line.
    log::debug!("Reading an overlong unterminated line.");
    assert!(matches!(
        reader.decode(),
        Err(WALError::DataCorruption(DataCorruptionError::LineTooLong { .. }))
    ));
    assert_eq!(reader.decode().unwrap(), None);
}
