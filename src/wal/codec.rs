/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Line-oriented encoding of WAL entries.
//!
//! Every entry occupies one line. A timed message is written as
//! `base64(crc32c(sized) || sized) + "\n"`, where `sized` is the Borsh encoding of the
//! [TimedWALMessage] prefixed with its length as a big-endian `u32`, and the CRC is stored big-endian.
//! A height marker is written as `#` followed by the JSON object `{"h":<height>}` and a newline.
//!
//! Because a line is only considered complete once its newline has been read, a line that was
//! partially written when the process crashed is treated as the end of the log.

use std::io::{BufRead, BufReader, Read, Write};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::types::basic::Height;

use super::{DataCorruptionError, MetaMessage, TimedWALMessage, WALEntry, WALError};

/// Maximum size of the length-prefixed Borsh encoding of a single [TimedWALMessage].
pub const MAX_MSG_SIZE_BYTES: usize = 1024 * 1024;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const CRC_SIZE: usize = 4;
const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Serialize, Deserialize)]
struct MetaJSON {
    h: u64,
}

pub struct WALWriter<W: Write> {
    wr: W,
    max_size: usize,
}

impl<W: Write> WALWriter<W> {
    pub fn new(wr: W, max_size: usize) -> WALWriter<W> {
        WALWriter { wr, max_size }
    }

    pub fn write(&mut self, msg: &TimedWALMessage) -> Result<(), WALError> {
        let line = encode_timed_message(msg, self.max_size)?;
        self.wr.write_all(&line)?;
        Ok(())
    }

    pub fn write_meta(&mut self, meta: &MetaMessage) -> Result<(), WALError> {
        self.wr.write_all(&encode_meta(meta)?)?;
        Ok(())
    }
}

/// Encode `msg` as a complete line, including the trailing newline.
pub fn encode_timed_message(msg: &TimedWALMessage, max_size: usize) -> Result<Vec<u8>, WALError> {
    let payload = msg.try_to_vec()?;
    let size = LENGTH_PREFIX_SIZE + payload.len();
    if max_size < size {
        return Err(WALError::MessageTooBig {
            size,
            max: max_size,
        });
    }

    let mut sized = Vec::with_capacity(size);
    sized.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    sized.extend_from_slice(&payload);

    let mut record = Vec::with_capacity(CRC_SIZE + size);
    record.extend_from_slice(&CASTAGNOLI.checksum(&sized).to_be_bytes());
    record.extend_from_slice(&sized);

    let mut line = STANDARD_NO_PAD.encode(record).into_bytes();
    line.push(b'\n');
    Ok(line)
}

/// Encode `meta` as a complete line, including the trailing newline.
pub fn encode_meta(meta: &MetaMessage) -> Result<Vec<u8>, WALError> {
    let json = serde_json::to_vec(&MetaJSON {
        h: meta.height.int(),
    })?;
    let mut line = Vec::with_capacity(json.len() + 2);
    line.push(b'#');
    line.extend_from_slice(&json);
    line.push(b'\n');
    Ok(line)
}

/// Decodes the entries written by a [WALWriter], verifying their checksums and lengths.
pub struct WALReader<R: Read> {
    brd: BufReader<R>,
    max_size: usize,
}

impl<R: Read> WALReader<R> {
    pub fn new(rd: R, max_size: usize) -> WALReader<R> {
        WALReader {
            brd: BufReader::new(rd),
            max_size,
        }
    }

    /// Get a mutable reference to the underlying reader, without losing buffered data.
    pub fn get_mut(&mut self) -> &mut R {
        self.brd.get_mut()
    }

    /// Read the next entry. Returns `Ok(None)` at the end of the stream, including when the last line
    /// is incomplete.
    ///
    /// A [WALError::DataCorruption] leaves the reader positioned after the corrupt line, so callers may
    /// skip it and keep reading.
    pub fn decode(&mut self) -> Result<Option<WALEntry>, WALError> {
        let max_line = max_line_len(self.max_size);
        let mut line = Vec::new();
        self.brd
            .by_ref()
            .take(max_line as u64)
            .read_until(b'\n', &mut line)?;
        match line.pop() {
            Some(b'\n') => (),
            Some(_) if line.len() + 1 == max_line => {
                self.skip_line()?;
                return Err(DataCorruptionError::LineTooLong { max: max_line }.into());
            }
            Some(_) => {
                log::warn!(
                    "Ignoring incomplete WAL line at end of log ({} bytes)",
                    line.len() + 1
                );
                return Ok(None);
            }
            None => return Ok(None),
        }

        decode_line(&line, self.max_size).map(Some)
    }

    fn skip_line(&mut self) -> Result<(), WALError> {
        loop {
            let buf = self.brd.fill_buf()?;
            if buf.is_empty() {
                return Ok(());
            }
            match buf.iter().position(|byte| *byte == b'\n') {
                Some(end) => {
                    self.brd.consume(end + 1);
                    return Ok(());
                }
                None => {
                    let len = buf.len();
                    self.brd.consume(len);
                }
            }
        }
    }
}

/// Length of the longest line a message of `max_size` bytes encodes to, including the newline.
fn max_line_len(max_size: usize) -> usize {
    let record = CRC_SIZE + max_size;
    (record * 4 + 2) / 3 + 1
}

impl<R: Read> Iterator for WALReader<R> {
    type Item = Result<WALEntry, WALError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decode().transpose()
    }
}

/// Decode a single line, without its trailing newline.
pub fn decode_line(line: &[u8], max_size: usize) -> Result<WALEntry, WALError> {
    if line.is_empty() {
        return Err(DataCorruptionError::EmptyLine.into());
    }

    if line[0] == b'#' {
        let meta: MetaJSON = serde_json::from_slice(&line[1..])
            .map_err(|err| DataCorruptionError::InvalidMeta(err.to_string()))?;
        return Ok(WALEntry::Meta(MetaMessage {
            height: Height::new(meta.h),
        }));
    }

    let record = STANDARD_NO_PAD
        .decode(line)
        .map_err(|err| DataCorruptionError::InvalidBase64(err.to_string()))?;
    if record.len() < CRC_SIZE {
        return Err(DataCorruptionError::ShortRecord { len: record.len() }.into());
    }
    let (crc, sized) = record.split_at(CRC_SIZE);
    if max_size < sized.len() {
        return Err(DataCorruptionError::TooBig {
            size: sized.len(),
            max: max_size,
        }
        .into());
    }
    if sized.len() <= LENGTH_PREFIX_SIZE {
        return Err(DataCorruptionError::EmptyPayload.into());
    }

    let read_crc = u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual_crc = CASTAGNOLI.checksum(sized);
    if read_crc != actual_crc {
        return Err(DataCorruptionError::ChecksumMismatch {
            read: read_crc,
            actual: actual_crc,
        }
        .into());
    }

    let (length, payload) = sized.split_at(LENGTH_PREFIX_SIZE);
    let length = u32::from_be_bytes([length[0], length[1], length[2], length[3]]) as usize;
    if length != payload.len() {
        return Err(DataCorruptionError::LengthMismatch {
            expected: length,
            actual: payload.len(),
        }
        .into());
    }

    let msg = TimedWALMessage::try_from_slice(payload)
        .map_err(|err| DataCorruptionError::UndecodablePayload(err.to_string()))?;
    Ok(WALEntry::Timed(msg))
}
