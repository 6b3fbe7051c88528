/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A group of append-only files that together hold one logical log.
//!
//! New data is always appended to the "head" file at `<path>`. When the head grows past
//! `head_size_limit` it is renamed to `<path>.NNN`, where `NNN` is the head's index, and a new, empty head
//! is opened with the next index. When the group grows past `total_size_limit`, the segments with the
//! lowest indices are deleted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_HEAD_SIZE_LIMIT: u64 = 10 * 1024 * 1024;
pub const DEFAULT_TOTAL_SIZE_LIMIT: u64 = 1024 * 1024 * 1024;

/// Upper bound on the number of segments deleted in one pruning pass.
const MAX_SEGMENTS_TO_REMOVE: u32 = 1000;

pub struct Group {
    head_path: PathBuf,
    head: BufWriter<File>,
    head_size: u64,
    total_size: u64,
    min_index: u32,
    max_index: u32,
    head_size_limit: u64,
    total_size_limit: u64,
}

impl Group {
    /// Open (creating if needed) the group whose head lives at `head_path`. A `total_size_limit` of 0
    /// means the group is never pruned.
    pub fn open(
        head_path: impl Into<PathBuf>,
        head_size_limit: u64,
        total_size_limit: u64,
    ) -> io::Result<Group> {
        let head_path = head_path.into();
        if let Some(dir) = head_path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let head = open_head(&head_path)?;

        let mut group = Group {
            head_path,
            head: BufWriter::new(head),
            head_size: 0,
            total_size: 0,
            min_index: 0,
            max_index: 0,
            head_size_limit,
            total_size_limit,
        };
        group.read_group_info()?;
        Ok(group)
    }

    pub fn head_path(&self) -> &Path {
        &self.head_path
    }

    /// The index of the oldest file in the group, including the head.
    pub fn min_index(&self) -> u32 {
        self.min_index
    }

    /// The index of the head.
    pub fn max_index(&self) -> u32 {
        self.max_index
    }

    pub fn head_size(&self) -> u64 {
        self.head_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn flush_and_sync(&mut self) -> io::Result<()> {
        self.head.flush()?;
        self.head.get_ref().sync_all()
    }

    /// Rotate the head if it has reached `head_size_limit`.
    pub fn check_head_size_limit(&mut self) -> io::Result<()> {
        if self.head_size_limit > 0 && self.head_size >= self.head_size_limit {
            self.rotate_file()?;
        }
        Ok(())
    }

    /// Turn the head into the segment with the head's index and start a new, empty head. Afterwards,
    /// prune the oldest segments if the group has outgrown `total_size_limit`.
    pub fn rotate_file(&mut self) -> io::Result<()> {
        self.flush_and_sync()?;
        fs::rename(&self.head_path, self.segment_path(self.max_index))?;
        self.head = BufWriter::new(open_head(&self.head_path)?);
        self.head_size = 0;
        self.max_index += 1;
        log::debug!("Rotated WAL head, new head index: {}", self.max_index);

        self.ensure_total_size_limit();
        Ok(())
    }

    /// Get a reader over the files with indices `start_index..=end_index`. Buffered writes are flushed
    /// first so that the reader sees everything written so far.
    pub fn new_reader(&mut self, start_index: u32, end_index: u32) -> io::Result<GroupReader> {
        self.flush()?;
        Ok(GroupReader {
            head_path: self.head_path.clone(),
            head_index: self.max_index,
            cur_index: start_index,
            end_index: end_index.min(self.max_index),
            cur_file: None,
        })
    }

    fn segment_path(&self, index: u32) -> PathBuf {
        segment_path(&self.head_path, index)
    }

    fn ensure_total_size_limit(&mut self) {
        if self.total_size_limit == 0 {
            return;
        }

        for _ in 0..MAX_SEGMENTS_TO_REMOVE {
            if self.total_size < self.total_size_limit || self.min_index == self.max_index {
                return;
            }
            let path = self.segment_path(self.min_index);
            let size = match fs::metadata(&path) {
                Ok(metadata) => metadata.len(),
                Err(err) => {
                    log::error!("Failed to stat WAL segment {}: {}", path.display(), err);
                    self.min_index += 1;
                    continue;
                }
            };
            if let Err(err) = fs::remove_file(&path) {
                log::error!("Failed to remove WAL segment {}: {}", path.display(), err);
                return;
            }
            self.min_index += 1;
            self.total_size = self.total_size.saturating_sub(size);
        }
    }

    fn read_group_info(&mut self) -> io::Result<()> {
        let dir = match self.head_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let head_base = match self.head_path.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_string(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "WAL path has no file name",
                ))
            }
        };

        let mut min_index: Option<u32> = None;
        let mut max_index: Option<u32> = None;
        let mut total_size = 0;
        let mut head_size = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name == head_base {
                head_size = entry.metadata()?.len();
                total_size += head_size;
            } else if let Some(index) = parse_segment_index(&head_base, file_name) {
                total_size += entry.metadata()?.len();
                min_index = Some(min_index.map_or(index, |min| min.min(index)));
                max_index = Some(max_index.map_or(index, |max| max.max(index)));
            }
        }

        // The head's index is one more than the highest numbered segment.
        match (min_index, max_index) {
            (Some(min), Some(max)) => {
                self.min_index = min;
                self.max_index = max + 1;
            }
            _ => {
                self.min_index = 0;
                self.max_index = 0;
            }
        }
        self.head_size = head_size;
        self.total_size = total_size;
        Ok(())
    }
}

/// Appends to the head. Written bytes are buffered until the next flush.
impl Write for Group {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.head.write(buf)?;
        self.head_size += n as u64;
        self.total_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.head.flush()
    }
}

/// Reads the files of a [Group] in index order as if they were a single stream.
///
/// When the reader reaches the end of `end_index`, it returns end-of-stream but keeps its position, so
/// that after [extend_to](GroupReader::extend_to) is called it continues with the next file.
pub struct GroupReader {
    head_path: PathBuf,
    head_index: u32,
    cur_index: u32,
    end_index: u32,
    cur_file: Option<File>,
}

impl GroupReader {
    pub fn cur_index(&self) -> u32 {
        self.cur_index
    }

    /// Extend the range of files read to include every file up to the group's head.
    pub fn extend_to_head(&mut self) {
        self.extend_to(self.head_index)
    }

    pub fn extend_to(&mut self, end_index: u32) {
        self.end_index = end_index.min(self.head_index).max(self.end_index);
    }

    fn file_path(&self, index: u32) -> PathBuf {
        if index == self.head_index {
            self.head_path.clone()
        } else {
            segment_path(&self.head_path, index)
        }
    }
}

impl Read for GroupReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.cur_file.is_none() {
                if self.cur_index > self.end_index {
                    return Ok(0);
                }
                self.cur_file = Some(File::open(self.file_path(self.cur_index))?);
            }

            let n = match self.cur_file.as_mut() {
                Some(file) => file.read(buf)?,
                None => return Ok(0),
            };
            if n > 0 || buf.is_empty() || self.cur_index >= self.end_index {
                return Ok(n);
            }

            // End of the current file: move on to the next one.
            self.cur_file = None;
            self.cur_index += 1;
        }
    }
}

fn open_head(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn segment_path(head_path: &Path, index: u32) -> PathBuf {
    let mut path = head_path.as_os_str().to_os_string();
    path.push(format!(".{:03}", index));
    PathBuf::from(path)
}

/// `Some(NNN)` if `file_name` is `<head_base>.NNN` with at least three digits.
fn parse_segment_index(head_base: &str, file_name: &str) -> Option<u32> {
    let suffix = file_name.strip_prefix(head_base)?.strip_prefix('.')?;
    if suffix.len() < 3 || !suffix.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
