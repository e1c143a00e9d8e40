//! The single log writer: active chunk appends, rotation, durability.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::core::Limits;

use super::checkpoint::{NamedCheckpoint, CHASER_CHECKPOINT, WRITER_CHECKPOINT};
use super::chunk::{
    fsync_dir, reject_symlink, ChunkFooter, ChunkHeader, ChunkId, ChunkInfo, CHUNK_FOOTER_LEN,
    CHUNK_HEADER_LEN,
};
use super::frame::encode_frame;
use super::reader::LogReader;
use super::record::LogRecord;
use super::{LogError, LogResult};

pub(crate) struct ActiveChunk {
    pub file: File,
    pub path: PathBuf,
    pub header: ChunkHeader,
    /// Bytes of record frames written so far.
    pub data_bytes: u64,
}

/// Writer-owned facade over the chunk directory. Exactly one `ChunkedLog`
/// exists per store; readers hold cheap `LogReader` handles.
pub struct ChunkedLog {
    dir: PathBuf,
    chunk_max_bytes: u64,
    max_record_bytes: usize,
    active: ActiveChunk,
    chunks: Arc<RwLock<Vec<ChunkInfo>>>,
    write_pos: i64,
    flushed_pos: i64,
    unflushed_bytes: u64,
    writer_chk: NamedCheckpoint,
    chaser_chk: NamedCheckpoint,
    hasher: Sha256,
    record_count: u32,
}

impl ChunkedLog {
    /// Open or create a log directory, repairing a torn tail. See
    /// [`super::recovery`] for the scan.
    pub fn open(dir: &Path, limits: &Limits) -> LogResult<(Self, super::RecoveryReport)> {
        super::recovery::open_log(dir, limits)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        dir: PathBuf,
        limits: &Limits,
        active: ActiveChunk,
        chunks: Vec<ChunkInfo>,
        write_pos: i64,
        hasher: Sha256,
        record_count: u32,
    ) -> LogResult<Self> {
        let writer_chk = NamedCheckpoint::open(&dir, WRITER_CHECKPOINT);
        let chaser_chk = NamedCheckpoint::open(&dir, CHASER_CHECKPOINT);
        writer_chk.write(write_pos)?;
        chaser_chk.write(write_pos)?;
        Ok(Self {
            dir,
            chunk_max_bytes: limits.chunk_max_bytes,
            max_record_bytes: limits.max_record_bytes,
            active,
            chunks: Arc::new(RwLock::new(chunks)),
            write_pos,
            flushed_pos: write_pos,
            unflushed_bytes: 0,
            writer_chk,
            chaser_chk,
            hasher,
            record_count,
        })
    }

    /// Next free logical position.
    pub fn write_position(&self) -> i64 {
        self.write_pos
    }

    /// Position synchronized to disk.
    pub fn flushed_position(&self) -> i64 {
        self.flushed_pos
    }

    pub fn unflushed_bytes(&self) -> u64 {
        self.unflushed_bytes
    }

    pub fn reader(&self) -> LogReader {
        LogReader::new(Arc::clone(&self.chunks), self.max_record_bytes)
    }

    /// Append one record; returns its logical position. Bytes are in the OS
    /// page cache when this returns; call [`ChunkedLog::flush`] for
    /// durability.
    pub fn append(&mut self, record: &LogRecord) -> LogResult<i64> {
        let payload = record.encode()?;
        let frame = encode_frame(&payload, self.max_record_bytes)?;

        if self.active.data_bytes > 0
            && self.active.data_bytes + frame.len() as u64 > self.chunk_max_bytes
        {
            self.complete_active_chunk()?;
        }

        let position = self.write_pos;
        let offset = CHUNK_HEADER_LEN as u64 + self.active.data_bytes;
        self.active
            .file
            .seek(SeekFrom::Start(offset))
            .map_err(|source| LogError::io(&self.active.path, source))?;
        self.active
            .file
            .write_all(&frame)
            .map_err(|source| LogError::io(&self.active.path, source))?;

        self.hasher.update(&frame);
        self.record_count += 1;
        self.active.data_bytes += frame.len() as u64;
        self.write_pos += frame.len() as i64;
        self.unflushed_bytes += frame.len() as u64;
        self.set_active_extent(self.write_pos)?;

        Ok(position)
    }

    /// fsync the active chunk and advance the durable checkpoints.
    pub fn flush(&mut self) -> LogResult<()> {
        if self.flushed_pos == self.write_pos {
            return Ok(());
        }
        self.active
            .file
            .sync_all()
            .map_err(|source| LogError::io(&self.active.path, source))?;
        self.flushed_pos = self.write_pos;
        self.unflushed_bytes = 0;
        self.writer_chk.write(self.write_pos)?;
        self.chaser_chk.write(self.flushed_pos)
    }

    /// Seal the active chunk (footer + final header) and open the next one.
    /// A chunk with no records is left in place.
    pub fn complete_active_chunk(&mut self) -> LogResult<()> {
        if self.active.data_bytes == 0 {
            return Ok(());
        }
        self.flush()?;

        let mut header = self.active.header;
        header.logical_end = self.write_pos;
        header.physical_size =
            CHUNK_HEADER_LEN as u64 + self.active.data_bytes + CHUNK_FOOTER_LEN as u64;

        let digest = std::mem::take(&mut self.hasher).finalize();
        let mut data_hash = [0u8; 32];
        data_hash.copy_from_slice(&digest);
        let footer = ChunkFooter {
            is_complete: true,
            data_hash,
            record_count: self.record_count,
        };

        self.active
            .file
            .seek(SeekFrom::Start(0))
            .map_err(|source| LogError::io(&self.active.path, source))?;
        self.active
            .file
            .write_all(&header.encode())
            .map_err(|source| LogError::io(&self.active.path, source))?;
        self.active
            .file
            .seek(SeekFrom::Start(
                CHUNK_HEADER_LEN as u64 + self.active.data_bytes,
            ))
            .map_err(|source| LogError::io(&self.active.path, source))?;
        self.active
            .file
            .write_all(&footer.encode())
            .map_err(|source| LogError::io(&self.active.path, source))?;
        self.active
            .file
            .sync_all()
            .map_err(|source| LogError::io(&self.active.path, source))?;

        tracing::debug!(
            chunk = header.number,
            records = self.record_count,
            logical_end = self.write_pos,
            "chunk completed"
        );

        {
            let mut chunks = self.chunks.write().map_err(|_| LogError::LockPoisoned)?;
            if let Some(last) = chunks.last_mut() {
                last.complete = true;
                last.logical_end = self.write_pos;
            }
        }

        let next_header = ChunkHeader::new(header.number + 1, self.write_pos);
        let id = ChunkId::new(next_header.number, 0);
        let (file, path) = create_chunk_file(&self.dir, id, &next_header)?;
        {
            let mut chunks = self.chunks.write().map_err(|_| LogError::LockPoisoned)?;
            chunks.push(ChunkInfo {
                id,
                path: path.clone(),
                logical_start: self.write_pos,
                logical_end: self.write_pos,
                complete: false,
            });
        }
        self.active = ActiveChunk {
            file,
            path,
            header: next_header,
            data_bytes: 0,
        };
        self.record_count = 0;
        Ok(())
    }

    fn set_active_extent(&self, end: i64) -> LogResult<()> {
        let mut chunks = self.chunks.write().map_err(|_| LogError::LockPoisoned)?;
        if let Some(last) = chunks.last_mut() {
            last.logical_end = end;
        }
        Ok(())
    }
}

/// Create a chunk file: header written and fsynced under a temp name, then
/// renamed into place so a crash never leaves a half-written header.
pub(crate) fn create_chunk_file(
    dir: &Path,
    id: ChunkId,
    header: &ChunkHeader,
) -> LogResult<(File, PathBuf)> {
    reject_symlink(dir)?;
    let file_name = id.file_name();
    let tmp_path = dir.join(format!("{file_name}.tmp"));
    let final_path = dir.join(&file_name);

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)
        .map_err(|source| LogError::io(&tmp_path, source))?;
    file.write_all(&header.encode())
        .map_err(|source| LogError::io(&tmp_path, source))?;
    file.sync_all()
        .map_err(|source| LogError::io(&tmp_path, source))?;
    drop(file);

    fs::rename(&tmp_path, &final_path).map_err(|source| LogError::io(&final_path, source))?;
    fsync_dir(dir)?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&final_path)
        .map_err(|source| LogError::io(&final_path, source))?;
    Ok((file, final_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventId, EventNumber, StreamId};
    use crate::log::record::{PrepareFlags, PrepareLog};
    use bytes::Bytes;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn small_limits() -> Limits {
        Limits {
            chunk_max_bytes: 256,
            max_record_bytes: 1024,
            ..Limits::default()
        }
    }

    fn prepare(n: i64, data: &'static [u8]) -> LogRecord {
        LogRecord::Prepare(PrepareLog {
            flags: PrepareFlags::DATA
                .with(PrepareFlags::TRANSACTION_BEGIN)
                .with(PrepareFlags::TRANSACTION_END)
                .with(PrepareFlags::IMPLICIT_COMMIT),
            transaction_position: 0,
            transaction_offset: 0,
            stream: StreamId::parse("s").unwrap(),
            event_number: EventNumber::new(n).unwrap(),
            event_id: EventId::new(Uuid::from_bytes([n as u8 + 1; 16])),
            event_type: "t".to_string(),
            created_ms: 1_700_000_000_000,
            data: Bytes::from_static(data),
            metadata: Bytes::new(),
        })
    }

    #[test]
    fn append_advances_positions() {
        let temp = TempDir::new().unwrap();
        let (mut log, _) = ChunkedLog::open(temp.path(), &Limits::default()).unwrap();
        let base = log.write_position();

        let first = log.append(&prepare(0, b"a")).unwrap();
        let second = log.append(&prepare(1, b"b")).unwrap();
        assert_eq!(first, base);
        assert!(second > first);
        assert_eq!(log.write_position(), log.reader().end_position());
    }

    #[test]
    fn flush_advances_checkpoints() {
        let temp = TempDir::new().unwrap();
        let (mut log, _) = ChunkedLog::open(temp.path(), &Limits::default()).unwrap();
        log.append(&prepare(0, b"abc")).unwrap();
        assert!(log.unflushed_bytes() > 0);
        log.flush().unwrap();
        assert_eq!(log.unflushed_bytes(), 0);
        assert_eq!(log.flushed_position(), log.write_position());

        let chk = NamedCheckpoint::open(temp.path(), WRITER_CHECKPOINT);
        assert_eq!(chk.read().unwrap(), Some(log.write_position()));
    }

    #[test]
    fn rotation_seals_previous_chunk() {
        let temp = TempDir::new().unwrap();
        let (mut log, _) = ChunkedLog::open(temp.path(), &small_limits()).unwrap();

        // Enough appends to exceed the 256-byte chunk limit.
        for n in 0..4 {
            log.append(&prepare(n, b"padding-padding-padding-padding")).unwrap();
        }
        log.flush().unwrap();

        let chunk_files: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| {
                let name = e.unwrap().file_name().to_string_lossy().to_string();
                ChunkId::parse_file_name(&name)
            })
            .collect();
        assert!(chunk_files.len() >= 2, "expected rotation, got {chunk_files:?}");

        // First chunk carries a valid completion footer.
        let first = temp.path().join(ChunkId::new(0, 0).file_name());
        let bytes = fs::read(first).unwrap();
        let header = ChunkHeader::decode(&bytes).unwrap();
        assert_ne!(header.logical_end, super::super::chunk::LOGICAL_END_OPEN);
        let footer_offset = header.physical_size as usize - CHUNK_FOOTER_LEN;
        let footer = ChunkFooter::decode(&bytes[footer_offset..]).unwrap();
        assert!(footer.is_complete);
        assert!(footer.record_count > 0);
    }

    #[test]
    fn completed_chunk_hash_covers_data_region() {
        let temp = TempDir::new().unwrap();
        let (mut log, _) = ChunkedLog::open(temp.path(), &Limits::default()).unwrap();
        log.append(&prepare(0, b"hash-me")).unwrap();
        log.complete_active_chunk().unwrap();

        let path = temp.path().join(ChunkId::new(0, 0).file_name());
        let bytes = fs::read(path).unwrap();
        let header = ChunkHeader::decode(&bytes).unwrap();
        let data_end = header.physical_size as usize - CHUNK_FOOTER_LEN;
        let footer = ChunkFooter::decode(&bytes[data_end..]).unwrap();

        let mut hasher = Sha256::new();
        hasher.update(&bytes[CHUNK_HEADER_LEN..data_end]);
        let digest = hasher.finalize();
        assert_eq!(footer.data_hash.as_slice(), digest.as_slice());
    }
}
