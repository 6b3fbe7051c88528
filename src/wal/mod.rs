//! The consensus write-ahead log.
//!
//! Before the consensus engine acts on any input (a proposal, block part, or vote; a timeout; or
//! its own transition to a new step), it appends the input to the WAL. After a crash, replaying the
//! entries written since the start of the current height brings the engine back to the exact state it
//! was in, so that it never signs two different votes for the same height, round, and step.
//!
//! Heights are demarcated by [MetaMessage]s: a marker with height `h` is written right after block
//! `h - 1` is saved, and before it is applied. [WAL::search_for_height] finds the marker of a height.
//!
//! The log itself is stored in a [group](group::Group) of files and encoded by the [codec].

pub mod codec;

pub mod group;

use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::consensus::messages::{MsgInfo, TimeoutInfo};
use crate::consensus::round_state::HRS;
use crate::service::{Service, ServiceError};
use crate::types::basic::{Height, Timestamp};

use codec::{WALReader, WALWriter, MAX_MSG_SIZE_BYTES};
use group::{Group, GroupReader, DEFAULT_HEAD_SIZE_LIMIT, DEFAULT_TOTAL_SIZE_LIMIT};

/// How often buffered writes are flushed to disk, in the absence of `write_sync` calls.
pub const WAL_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum WALMessage {
    /// The engine entered a new step.
    RoundStep(HRS),
    MsgInfo(MsgInfo),
    Timeout(TimeoutInfo),
}

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct TimedWALMessage {
    pub time: Timestamp,
    pub msg: WALMessage,
}

/// Marks the start of `height` (and the end of `height - 1`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MetaMessage {
    pub height: Height,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WALEntry {
    Timed(TimedWALMessage),
    Meta(MetaMessage),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum WALSearchMode {
    /// Probe the newest files first, stepping back exponentially, then switch to binary search.
    /// Fast when the height searched for is recent, which it is when replaying after a crash.
    #[default]
    Backwards,
    Binary,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct WALSearchOptions {
    pub mode: WALSearchMode,
    /// Skip corrupt lines instead of failing the search.
    pub ignore_data_corruption_errors: bool,
}

pub trait WAL: Service + Send {
    /// Append `msg`. The write is buffered, and reaches disk at the next sync or periodic flush.
    fn write(&mut self, msg: WALMessage) -> Result<(), WALError>;

    /// Append `msg`, then flush and fsync the log.
    fn write_sync(&mut self, msg: WALMessage) -> Result<(), WALError>;

    /// Append the height marker `meta`, then flush and fsync the log.
    fn write_meta_sync(&mut self, meta: MetaMessage) -> Result<(), WALError>;

    fn flush_and_sync(&mut self) -> Result<(), WALError>;

    /// Find the marker of `height`. If found, returns a reader positioned right after the marker that
    /// reads every entry written after it.
    fn search_for_height(
        &mut self,
        height: Height,
        options: &WALSearchOptions,
    ) -> Result<Option<WALReader<GroupReader>>, WALError>;
}

/// A [WAL] stored in a [Group] of files, flushed to disk periodically by a background thread.
pub struct BaseWAL {
    group: Arc<Mutex<Group>>,
    max_msg_size: usize,
    flush_interval: Duration,
    flush_thread: Option<JoinHandle<()>>,
    flush_thread_shutdown: Option<Sender<()>>,
}

impl BaseWAL {
    /// Open the WAL whose head file is at `path`, with the default size limits.
    pub fn open(path: impl Into<PathBuf>) -> Result<BaseWAL, WALError> {
        BaseWAL::open_with_limits(path, DEFAULT_HEAD_SIZE_LIMIT, DEFAULT_TOTAL_SIZE_LIMIT)
    }

    pub fn open_with_limits(
        path: impl Into<PathBuf>,
        head_size_limit: u64,
        total_size_limit: u64,
    ) -> Result<BaseWAL, WALError> {
        let group = Group::open(path, head_size_limit, total_size_limit)?;
        Ok(BaseWAL {
            group: Arc::new(Mutex::new(group)),
            max_msg_size: MAX_MSG_SIZE_BYTES,
            flush_interval: WAL_FLUSH_INTERVAL,
            flush_thread: None,
            flush_thread_shutdown: None,
        })
    }

    /// The indices of the oldest file and of the head file of the underlying group.
    pub fn file_indices(&self) -> Result<(u32, u32), WALError> {
        let group = self.lock_group()?;
        Ok((group.min_index(), group.max_index()))
    }

    fn lock_group(&self) -> Result<MutexGuard<'_, Group>, WALError> {
        self.group.lock().map_err(|_| WALError::LockPoisoned)
    }

    fn write_entry(&mut self, msg: WALMessage) -> Result<(), WALError> {
        let max_msg_size = self.max_msg_size;
        let mut group = self.lock_group()?;
        let timed_msg = TimedWALMessage {
            time: Timestamp::now(),
            msg,
        };
        WALWriter::new(&mut *group, max_msg_size).write(&timed_msg)?;
        group.check_head_size_limit()?;
        Ok(())
    }
}

impl WAL for BaseWAL {
    fn write(&mut self, msg: WALMessage) -> Result<(), WALError> {
        self.write_entry(msg)
    }

    fn write_sync(&mut self, msg: WALMessage) -> Result<(), WALError> {
        self.write_entry(msg)?;
        self.flush_and_sync()
    }

    fn write_meta_sync(&mut self, meta: MetaMessage) -> Result<(), WALError> {
        let max_msg_size = self.max_msg_size;
        let mut group = self.lock_group()?;
        WALWriter::new(&mut *group, max_msg_size).write_meta(&meta)?;
        group.flush_and_sync()?;
        group.check_head_size_limit()?;
        Ok(())
    }

    fn flush_and_sync(&mut self) -> Result<(), WALError> {
        Ok(self.lock_group()?.flush_and_sync()?)
    }

    fn search_for_height(
        &mut self,
        height: Height,
        options: &WALSearchOptions,
    ) -> Result<Option<WALReader<GroupReader>>, WALError> {
        let max_msg_size = self.max_msg_size;
        let mut group = self.lock_group()?;

        // Indices are signed, since the backwards search may step below 0.
        let mut min = group.min_index() as i64;
        let mut max = group.max_index() as i64;
        log::info!(
            "Searching WAL for height {} (files {} to {})",
            height,
            min,
            max
        );

        let mut mode = options.mode;
        // Backwards search offset, goes 0, -1, -2, -4, -8, ...
        let mut backoff: i64 = 0;
        // Forward offset, for when a file contains no markers.
        let mut idxoff: i64 = 0;

        'files: while min <= max {
            let index = match mode {
                WALSearchMode::Backwards => {
                    let index = max + backoff + idxoff;
                    if max < index {
                        // Files from max + backoff onwards contain no marker.
                        idxoff = 0;
                        max = max + backoff - 1;
                        backoff = if backoff == 0 { -1 } else { backoff * 2 };
                        continue 'files;
                    }
                    if index < min {
                        backoff = 0;
                        idxoff = 0;
                        mode = WALSearchMode::Binary;
                        continue 'files;
                    }
                    index
                }
                WALSearchMode::Binary => {
                    let mid = (min + max + 1) / 2;
                    let index = mid + idxoff;
                    if max < index {
                        idxoff = 0;
                        max = mid - 1;
                        continue 'files;
                    }
                    index
                }
            };

            let file_reader = group.new_reader(index as u32, index as u32)?;
            let mut reader = WALReader::new(file_reader, max_msg_size);

            loop {
                let meta = match reader.decode() {
                    Ok(Some(WALEntry::Meta(meta))) => meta,
                    Ok(Some(WALEntry::Timed(_))) => continue,
                    Ok(None) => {
                        // No (more) markers in this file.
                        idxoff += 1;
                        continue 'files;
                    }
                    Err(WALError::DataCorruption(err)) if options.ignore_data_corruption_errors => {
                        log::error!("Skipping corrupt WAL entry in file {}: {:?}", index, err);
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                if height < meta.height {
                    // The marker is in an earlier file.
                    idxoff = 0;
                    match mode {
                        WALSearchMode::Backwards => {
                            if backoff == 0 {
                                max -= 1;
                                backoff = -1;
                            } else {
                                max += backoff;
                                backoff *= 2;
                            }
                            if max + backoff * 2 <= min {
                                log::debug!(
                                    "Switching to binary search for height {} (files {} to {})",
                                    height,
                                    min,
                                    max
                                );
                                backoff = 0;
                                mode = WALSearchMode::Binary;
                            }
                        }
                        WALSearchMode::Binary => max = (min + max + 1) / 2 - 1,
                    }
                    continue 'files;
                } else if meta.height == height {
                    log::info!("Found height {} in WAL file {}", height, index);
                    reader.get_mut().extend_to_head();
                    return Ok(Some(reader));
                } else {
                    // The marker comes later, maybe in this file.
                    match mode {
                        WALSearchMode::Backwards if backoff != 0 => {
                            idxoff = 0;
                            backoff = 0;
                            min = index;
                            mode = WALSearchMode::Binary;
                            continue 'files;
                        }
                        WALSearchMode::Binary if index < max => {
                            idxoff = 0;
                            min = index;
                            continue 'files;
                        }
                        // This is the last candidate file: keep reading it.
                        _ => continue,
                    }
                }
            }
        }

        Ok(None)
    }
}

impl Service for BaseWAL {
    fn start(&mut self) -> Result<(), ServiceError> {
        if self.flush_thread.is_some() {
            return Err(ServiceError::AlreadyStarted);
        }

        let (shutdown, shutdown_receiver) = mpsc::channel();
        let group = self.group.clone();
        let flush_interval = self.flush_interval;
        let flush_thread = thread::spawn(move || loop {
            match shutdown_receiver.recv_timeout(flush_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => match group.lock() {
                    Ok(mut group) => {
                        if let Err(err) = group.flush_and_sync() {
                            log::error!("Periodic WAL flush failed: {}", err);
                        }
                    }
                    Err(_) => return,
                },
            }
        });

        self.flush_thread = Some(flush_thread);
        self.flush_thread_shutdown = Some(shutdown);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        let (Some(shutdown), Some(flush_thread)) =
            (self.flush_thread_shutdown.take(), self.flush_thread.take())
        else {
            return Err(ServiceError::NotStarted);
        };
        if shutdown.send(()).is_err() {
            log::debug!("WAL flush thread already exited");
        }
        flush_thread
            .join()
            .map_err(|_| ServiceError::Failed(String::from("WAL flush thread panicked")))?;

        self.flush_and_sync()
            .map_err(|err| ServiceError::Failed(format!("final WAL flush failed: {:?}", err)))
    }

    fn wait(&mut self) {
        if let Some(flush_thread) = self.flush_thread.take() {
            let _ = flush_thread.join();
        }
    }
}

impl Drop for BaseWAL {
    fn drop(&mut self) {
        if self.flush_thread.is_some() {
            if let Err(err) = self.stop() {
                log::error!("Failed to stop WAL: {}", err);
            }
        }
    }
}

/// A [WAL] that discards everything written to it.
#[derive(Default)]
pub struct NopWAL;

impl WAL for NopWAL {
    fn write(&mut self, _: WALMessage) -> Result<(), WALError> {
        Ok(())
    }

    fn write_sync(&mut self, _: WALMessage) -> Result<(), WALError> {
        Ok(())
    }

    fn write_meta_sync(&mut self, _: MetaMessage) -> Result<(), WALError> {
        Ok(())
    }

    fn flush_and_sync(&mut self) -> Result<(), WALError> {
        Ok(())
    }

    fn search_for_height(
        &mut self,
        _: Height,
        _: &WALSearchOptions,
    ) -> Result<Option<WALReader<GroupReader>>, WALError> {
        Ok(None)
    }
}

impl Service for NopWAL {
    fn start(&mut self) -> Result<(), ServiceError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        Ok(())
    }

    fn wait(&mut self) {}
}

#[derive(Debug)]
pub enum WALError {
    Io(io::Error),
    Json(serde_json::Error),
    MessageTooBig { size: usize, max: usize },
    DataCorruption(DataCorruptionError),
    LockPoisoned,
}

impl WALError {
    pub fn is_data_corruption(&self) -> bool {
        matches!(self, WALError::DataCorruption(_))
    }
}

impl From<io::Error> for WALError {
    fn from(value: io::Error) -> Self {
        WALError::Io(value)
    }
}

impl From<serde_json::Error> for WALError {
    fn from(value: serde_json::Error) -> Self {
        WALError::Json(value)
    }
}

impl From<DataCorruptionError> for WALError {
    fn from(value: DataCorruptionError) -> Self {
        WALError::DataCorruption(value)
    }
}

/// Data on disk does not decode into a WAL entry.
#[derive(Debug, PartialEq, Eq)]
pub enum DataCorruptionError {
    EmptyLine,
    InvalidMeta(String),
    InvalidBase64(String),
    ShortRecord { len: usize },
    TooBig { size: usize, max: usize },
    LineTooLong { max: usize },
    EmptyPayload,
    ChecksumMismatch { read: u32, actual: u32 },
    LengthMismatch { expected: usize, actual: usize },
    UndecodablePayload(String),
}
