//! Shared read access to the chunk set.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::core::LogPosition;

use super::chunk::{ChunkFooter, ChunkHeader, ChunkInfo, CHUNK_FOOTER_LEN, CHUNK_HEADER_LEN};
use super::frame::{FRAME_OVERHEAD, FRAME_PREFIX_LEN, FRAME_SUFFIX_LEN};
use super::record::{LogRecord, PrepareLog};
use super::{LogError, LogResult};

/// A decoded record plus its logical placement.
#[derive(Clone, Debug)]
pub struct RecordAt {
    pub position: i64,
    pub next_position: i64,
    pub record: LogRecord,
}

/// Cheap, cloneable handle for reading the log. Completed chunks are
/// immutable; the active chunk is readable up to its published extent.
#[derive(Clone)]
pub struct LogReader {
    chunks: Arc<RwLock<Vec<ChunkInfo>>>,
    max_record_bytes: usize,
}

impl LogReader {
    pub(crate) fn new(chunks: Arc<RwLock<Vec<ChunkInfo>>>, max_record_bytes: usize) -> Self {
        Self {
            chunks,
            max_record_bytes,
        }
    }

    /// Exclusive end of readable data.
    pub fn end_position(&self) -> i64 {
        self.chunks
            .read()
            .ok()
            .and_then(|chunks| chunks.last().map(|info| info.logical_end))
            .unwrap_or(0)
    }

    /// First readable position (start of the oldest retained chunk).
    pub fn start_position(&self) -> i64 {
        self.chunks
            .read()
            .ok()
            .and_then(|chunks| chunks.first().map(|info| info.logical_start))
            .unwrap_or(0)
    }

    fn locate(&self, position: i64) -> LogResult<ChunkInfo> {
        let chunks = self.chunks.read().map_err(|_| LogError::LockPoisoned)?;
        chunks
            .iter()
            .find(|info| info.contains(position))
            .cloned()
            .ok_or(LogError::PositionOutOfRange { position })
    }

    /// Read the record whose frame starts at `position`.
    pub fn read_at(&self, position: i64) -> LogResult<RecordAt> {
        let info = self.locate(position)?;
        let mut file = File::open(&info.path).map_err(|source| LogError::io(&info.path, source))?;
        self.read_in_chunk(&mut file, &info, position)
    }

    fn read_in_chunk(&self, file: &mut File, info: &ChunkInfo, position: i64) -> LogResult<RecordAt> {
        file.seek(SeekFrom::Start(info.file_offset(position)))
            .map_err(|source| LogError::io(&info.path, source))?;

        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        file.read_exact(&mut prefix)
            .map_err(|source| LogError::io(&info.path, source))?;
        let length = u32::from_le_bytes(prefix) as usize;
        if length == 0 || length > self.max_record_bytes {
            return Err(LogError::FrameLengthInvalid {
                reason: format!("frame length {length} at position {position}"),
            });
        }
        if position + (length + FRAME_OVERHEAD) as i64 > info.logical_end {
            return Err(LogError::FrameTorn {
                reason: format!("frame at {position} extends past chunk extent"),
            });
        }

        let mut body = vec![0u8; length + FRAME_SUFFIX_LEN];
        file.read_exact(&mut body)
            .map_err(|source| LogError::io(&info.path, source))?;
        let suffix = u32::from_le_bytes(body[length..].try_into().expect("4 bytes"));
        if suffix as usize != length {
            return Err(LogError::FrameSuffixMismatch {
                prefix: length as u32,
                suffix,
            });
        }
        body.truncate(length);

        let record = LogRecord::decode(&body)?;
        Ok(RecordAt {
            position,
            next_position: position + (length + FRAME_OVERHEAD) as i64,
            record,
        })
    }

    /// Iterate records in `[from, end_exclusive)` in log order.
    pub fn scan_forward(&self, from: i64, end_exclusive: i64) -> ForwardScan {
        ForwardScan {
            reader: self.clone(),
            next: from,
            end: end_exclusive,
        }
    }

    /// Iterate records backward, starting with the record that ends at
    /// `from_exclusive`.
    pub fn scan_backward(&self, from_exclusive: i64) -> BackwardScan {
        BackwardScan {
            reader: self.clone(),
            cursor: from_exclusive,
        }
    }

    /// Read the record whose frame ends at `end_position`.
    fn read_before(&self, end_position: i64) -> LogResult<RecordAt> {
        let info = self.locate(end_position - 1)?;
        let mut file = File::open(&info.path).map_err(|source| LogError::io(&info.path, source))?;

        let suffix_offset = info.file_offset(end_position - FRAME_SUFFIX_LEN as i64);
        file.seek(SeekFrom::Start(suffix_offset))
            .map_err(|source| LogError::io(&info.path, source))?;
        let mut suffix = [0u8; FRAME_SUFFIX_LEN];
        file.read_exact(&mut suffix)
            .map_err(|source| LogError::io(&info.path, source))?;
        let length = u32::from_le_bytes(suffix) as usize;
        if length == 0 || length > self.max_record_bytes {
            return Err(LogError::FrameLengthInvalid {
                reason: format!("frame suffix length {length} before position {end_position}"),
            });
        }

        let start = end_position - (length + FRAME_OVERHEAD) as i64;
        if start < info.logical_start {
            return Err(LogError::FrameTorn {
                reason: format!("frame ending at {end_position} starts before its chunk"),
            });
        }
        self.read_in_chunk(&mut file, &info, start)
    }

    /// Full log position of a committed event given its prepare. Implicit
    /// commits are their own commit; explicit transactions find their commit
    /// record, which the single writer lays down directly after the batch.
    pub fn resolve_event_position(
        &self,
        prepare: &PrepareLog,
        prepare_position: i64,
    ) -> LogResult<LogPosition> {
        if prepare.is_implicit_commit() {
            return Ok(LogPosition::single(prepare_position));
        }
        let end = self.end_position();
        for item in self.scan_forward(prepare_position, end) {
            let at = item?;
            if let LogRecord::Commit(commit) = &at.record {
                if commit.transaction_position == prepare.transaction_position {
                    return Ok(LogPosition {
                        commit: at.position,
                        prepare: prepare_position,
                    });
                }
            }
        }
        Err(LogError::RecordInvalid {
            reason: format!(
                "no commit record found for transaction at {}",
                prepare.transaction_position
            ),
        })
    }

    /// Verify a completed chunk's footer hash against its data region.
    pub fn verify_chunk(&self, number: u32) -> LogResult<()> {
        let info = {
            let chunks = self.chunks.read().map_err(|_| LogError::LockPoisoned)?;
            chunks
                .iter()
                .find(|info| info.id.number == number && info.complete)
                .cloned()
                .ok_or(LogError::PositionOutOfRange { position: -1 })?
        };
        let mut file = File::open(&info.path).map_err(|source| LogError::io(&info.path, source))?;
        let mut header_bytes = [0u8; CHUNK_HEADER_LEN];
        file.read_exact(&mut header_bytes)
            .map_err(|source| LogError::io(&info.path, source))?;
        let header = ChunkHeader::decode(&header_bytes)?;

        let data_len = header.physical_size as usize - CHUNK_HEADER_LEN - CHUNK_FOOTER_LEN;
        let mut hasher = Sha256::new();
        let mut remaining = data_len;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let take = remaining.min(buf.len());
            file.read_exact(&mut buf[..take])
                .map_err(|source| LogError::io(&info.path, source))?;
            hasher.update(&buf[..take]);
            remaining -= take;
        }
        let mut footer_bytes = [0u8; CHUNK_FOOTER_LEN];
        file.read_exact(&mut footer_bytes)
            .map_err(|source| LogError::io(&info.path, source))?;
        let footer = ChunkFooter::decode(&footer_bytes)?;

        let digest = hasher.finalize();
        if footer.data_hash.as_slice() != digest.as_slice() {
            return Err(LogError::ChunkHashMismatch { chunk: number });
        }
        Ok(())
    }
}

pub struct ForwardScan {
    reader: LogReader,
    next: i64,
    end: i64,
}

impl Iterator for ForwardScan {
    type Item = LogResult<RecordAt>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        match self.reader.read_at(self.next) {
            Ok(record) => {
                self.next = record.next_position;
                Some(Ok(record))
            }
            Err(err) => {
                self.next = self.end;
                Some(Err(err))
            }
        }
    }
}

pub struct BackwardScan {
    reader: LogReader,
    cursor: i64,
}

impl Iterator for BackwardScan {
    type Item = LogResult<RecordAt>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor <= self.reader.start_position() {
            return None;
        }
        match self.reader.read_before(self.cursor) {
            Ok(record) => {
                self.cursor = record.position;
                Some(Ok(record))
            }
            Err(err) => {
                self.cursor = self.reader.start_position();
                Some(Err(err))
            }
        }
    }
}
