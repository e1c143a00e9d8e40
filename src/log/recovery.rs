//! Startup scan: rebuild writer state and repair torn tails.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::core::Limits;

use super::checkpoint::{NamedCheckpoint, EPOCH_CHECKPOINT, TRUNCATE_CHECKPOINT};
use super::chunk::{
    reject_symlink, ChunkFooter, ChunkHeader, ChunkId, ChunkInfo, CHUNK_FOOTER_LEN,
    CHUNK_HEADER_LEN, LOGICAL_END_OPEN,
};
use super::frame::{FrameReader, FRAME_OVERHEAD};
use super::record::{LogRecord, SystemLog, SystemRecordKind};
use super::writer::{create_chunk_file, ActiveChunk, ChunkedLog};
use super::{LogError, LogResult};

/// What the startup scan found and repaired. Reported out-of-band; torn-write
/// truncation is not an error to callers.
#[derive(Clone, Debug, Default)]
pub struct RecoveryReport {
    pub chunks_scanned: usize,
    pub truncated_from: Option<i64>,
    pub truncated_bytes: u64,
    pub epoch: u64,
}

pub(crate) fn open_log(dir: &Path, limits: &Limits) -> LogResult<(ChunkedLog, RecoveryReport)> {
    reject_symlink(dir)?;
    fs::create_dir_all(dir).map_err(|source| LogError::io(dir, source))?;

    let mut report = RecoveryReport::default();
    let chunk_ids = discover_chunks(dir)?;
    report.chunks_scanned = chunk_ids.len();

    let mut chunks: Vec<ChunkInfo> = Vec::new();
    let mut active: Option<(ActiveChunk, Sha256, u32)> = None;

    let last_index = chunk_ids.len().saturating_sub(1);
    for (i, id) in chunk_ids.iter().enumerate() {
        let path = dir.join(id.file_name());
        let header = read_header(&path)?;
        if header.number != id.number {
            return Err(LogError::ChunkHeaderInvalid {
                reason: format!(
                    "chunk file {} declares number {}",
                    id.file_name(),
                    header.number
                ),
            });
        }
        if let Some(prev) = chunks.last() {
            if header.logical_start != prev.logical_end {
                return Err(LogError::ChunkHeaderInvalid {
                    reason: format!(
                        "chunk {} starts at {} but chunk {} ends at {}",
                        header.number, header.logical_start, prev.id.number, prev.logical_end
                    ),
                });
            }
        }

        let is_last = i == last_index;
        if header.logical_end != LOGICAL_END_OPEN {
            let footer = read_footer(&path, &header)?;
            if !footer.is_complete {
                return Err(LogError::ChunkFooterInvalid {
                    reason: format!("chunk {} footer not marked complete", header.number),
                });
            }
            chunks.push(ChunkInfo {
                id: *id,
                path,
                logical_start: header.logical_start,
                logical_end: header.logical_end,
                complete: true,
            });
            continue;
        }

        if !is_last {
            return Err(LogError::ChunkHeaderInvalid {
                reason: format!("chunk {} is open but not the last chunk", header.number),
            });
        }

        let (chunk, hasher, records) = recover_active(dir, *id, header, limits, &mut report)?;
        chunks.push(ChunkInfo {
            id: *id,
            path: chunk.path.clone(),
            logical_start: header.logical_start,
            logical_end: header.logical_start + chunk.data_bytes as i64,
            complete: false,
        });
        active = Some((chunk, hasher, records));
    }

    // No active chunk on disk: open a fresh one after the last completed
    // chunk (or chunk zero on a brand new store).
    let (active, hasher, record_count) = match active {
        Some((chunk, hasher, records)) => (chunk, hasher, records),
        None => {
            let (number, logical_start) = chunks
                .last()
                .map(|info| (info.id.number + 1, info.logical_end))
                .unwrap_or((0, 0));
            let header = ChunkHeader::new(number, logical_start);
            let id = ChunkId::new(number, 0);
            let (file, path) = create_chunk_file(dir, id, &header)?;
            chunks.push(ChunkInfo {
                id,
                path: path.clone(),
                logical_start,
                logical_end: logical_start,
                complete: false,
            });
            (
                ActiveChunk {
                    file,
                    path,
                    header,
                    data_bytes: 0,
                },
                Sha256::new(),
                0,
            )
        }
    };

    let write_pos = chunks.last().map(|info| info.logical_end).unwrap_or(0);
    let mut log = ChunkedLog::assemble(
        dir.to_path_buf(),
        limits,
        active,
        chunks,
        write_pos,
        hasher,
        record_count,
    )?;

    report.epoch = begin_epoch(dir, &mut log)?;

    if let Some(from) = report.truncated_from {
        tracing::warn!(
            truncated_from = from,
            truncated_bytes = report.truncated_bytes,
            "torn write repaired at log tail"
        );
    }
    tracing::info!(
        chunks = report.chunks_scanned,
        write_position = log.write_position(),
        epoch = report.epoch,
        "log opened"
    );

    Ok((log, report))
}

fn discover_chunks(dir: &Path) -> LogResult<Vec<ChunkId>> {
    // Highest generation wins per chunk number (older generations are
    // leftovers of an interrupted scavenge).
    let mut by_number: BTreeMap<u32, ChunkId> = BTreeMap::new();
    for entry in fs::read_dir(dir).map_err(|source| LogError::io(dir, source))? {
        let entry = entry.map_err(|source| LogError::io(dir, source))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(id) = ChunkId::parse_file_name(name) else {
            continue;
        };
        by_number
            .entry(id.number)
            .and_modify(|existing| {
                if id.generation > existing.generation {
                    *existing = id;
                }
            })
            .or_insert(id);
    }

    let ids: Vec<ChunkId> = by_number.into_values().collect();
    for pair in ids.windows(2) {
        if pair[1].number != pair[0].number + 1 {
            return Err(LogError::ChunkHeaderInvalid {
                reason: format!(
                    "chunk numbering gap between {} and {}",
                    pair[0].number, pair[1].number
                ),
            });
        }
    }
    Ok(ids)
}

fn read_header(path: &Path) -> LogResult<ChunkHeader> {
    let mut file = fs::File::open(path).map_err(|source| LogError::io(path, source))?;
    let mut buf = [0u8; CHUNK_HEADER_LEN];
    file.read_exact(&mut buf)
        .map_err(|source| LogError::io(path, source))?;
    ChunkHeader::decode(&buf)
}

fn read_footer(path: &Path, header: &ChunkHeader) -> LogResult<ChunkFooter> {
    let mut file = fs::File::open(path).map_err(|source| LogError::io(path, source))?;
    let footer_offset = header
        .physical_size
        .checked_sub(CHUNK_FOOTER_LEN as u64)
        .ok_or_else(|| LogError::ChunkFooterInvalid {
            reason: format!("chunk {} physical size too small", header.number),
        })?;
    file.seek(SeekFrom::Start(footer_offset))
        .map_err(|source| LogError::io(path, source))?;
    let mut buf = [0u8; CHUNK_FOOTER_LEN];
    file.read_exact(&mut buf)
        .map_err(|source| LogError::io(path, source))?;
    ChunkFooter::decode(&buf)
}

/// Scan the active chunk forward, truncating at the first invalid frame.
fn recover_active(
    dir: &Path,
    id: ChunkId,
    header: ChunkHeader,
    limits: &Limits,
    report: &mut RecoveryReport,
) -> LogResult<(ActiveChunk, Sha256, u32)> {
    let path = dir.join(id.file_name());
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|source| LogError::io(&path, source))?;
    let file_len = file
        .metadata()
        .map_err(|source| LogError::io(&path, source))?
        .len();

    file.seek(SeekFrom::Start(CHUNK_HEADER_LEN as u64))
        .map_err(|source| LogError::io(&path, source))?;
    let mut frames = FrameReader::new(BufReader::new(&mut file), limits.max_record_bytes);
    let mut valid_len: u64 = 0;
    let mut record_count: u32 = 0;
    loop {
        match frames.read_next() {
            Ok(Some(payload)) => match LogRecord::decode(&payload) {
                Ok(_) => {
                    valid_len += (payload.len() + FRAME_OVERHEAD) as u64;
                    record_count += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        chunk = id.number,
                        offset = valid_len,
                        error = %err,
                        "undecodable record at log tail"
                    );
                    break;
                }
            },
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(
                    chunk = id.number,
                    offset = valid_len,
                    error = %err,
                    "invalid frame at log tail"
                );
                break;
            }
        }
    }
    drop(frames);

    let valid_file_len = CHUNK_HEADER_LEN as u64 + valid_len;
    if file_len > valid_file_len {
        let truncate_at = header.logical_start + valid_len as i64;
        let truncate_chk = NamedCheckpoint::open(dir, TRUNCATE_CHECKPOINT);
        truncate_chk.write(truncate_at)?;
        file.set_len(valid_file_len)
            .map_err(|source| LogError::io(&path, source))?;
        file.sync_all()
            .map_err(|source| LogError::io(&path, source))?;
        truncate_chk.write(-1)?;

        report.truncated_from = Some(truncate_at);
        report.truncated_bytes = file_len - valid_file_len;
    }

    // Re-read the valid data region to seed the running footer hash.
    let mut hasher = Sha256::new();
    file.seek(SeekFrom::Start(CHUNK_HEADER_LEN as u64))
        .map_err(|source| LogError::io(&path, source))?;
    let mut remaining = valid_len as usize;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let take = remaining.min(buf.len());
        file.read_exact(&mut buf[..take])
            .map_err(|source| LogError::io(&path, source))?;
        hasher.update(&buf[..take]);
        remaining -= take;
    }

    Ok((
        ActiveChunk {
            file,
            path,
            header,
            data_bytes: valid_len,
        },
        hasher,
        record_count,
    ))
}

/// Stamp a new epoch: append an epoch record and point `epoch.chk` at it.
fn begin_epoch(dir: &Path, log: &mut ChunkedLog) -> LogResult<u64> {
    let epoch_chk = NamedCheckpoint::open(dir, EPOCH_CHECKPOINT);
    let previous = match epoch_chk.read()? {
        Some(position) if position >= 0 => match log.reader().read_at(position) {
            Ok(at) => match at.record {
                LogRecord::System(system) if system.kind == SystemRecordKind::Epoch => {
                    decode_epoch_payload(&system.payload)
                }
                _ => 0,
            },
            Err(_) => 0,
        },
        _ => 0,
    };

    let epoch = previous + 1;
    let record = LogRecord::System(SystemLog {
        kind: SystemRecordKind::Epoch,
        payload: bytes::Bytes::copy_from_slice(&epoch.to_le_bytes()),
    });
    let position = log.append(&record)?;
    log.flush()?;
    epoch_chk.write(position)?;
    Ok(epoch)
}

fn decode_epoch_payload(payload: &[u8]) -> u64 {
    payload
        .get(0..8)
        .and_then(|slice| slice.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}
