//! Immutable sorted runs of index entries.
//!
//! File layout: 32-byte header, `entry_count` 24-byte entries sorted by
//! (stream-hash, event-number), then a midpoint table for binary search.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32c::crc32c;

use super::{IndexError, IndexResult, HASH_ALGO_SHA256_64};

pub const PTABLE_MAGIC: u32 = 0x5054_424C; // "PTBL"
pub const PTABLE_VERSION: u8 = 1;
pub const PTABLE_HEADER_LEN: usize = 32;
pub const PTABLE_ENTRY_LEN: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PTableEntry {
    pub stream_hash: u64,
    pub event_number: i64,
    pub position: i64,
}

impl PTableEntry {
    fn key(&self) -> (u64, i64) {
        (self.stream_hash, self.event_number)
    }

    fn encode(&self) -> [u8; PTABLE_ENTRY_LEN] {
        let mut buf = [0u8; PTABLE_ENTRY_LEN];
        buf[0..8].copy_from_slice(&self.stream_hash.to_le_bytes());
        buf[8..16].copy_from_slice(&self.event_number.to_le_bytes());
        buf[16..24].copy_from_slice(&self.position.to_le_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> PTableEntry {
        PTableEntry {
            stream_hash: u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes")),
            event_number: i64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes")),
            position: i64::from_le_bytes(bytes[16..24].try_into().expect("8 bytes")),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Midpoint {
    key: (u64, i64),
    entry_index: u64,
}

/// An open table: header validated, midpoints resident, entries on disk.
pub struct PTable {
    path: PathBuf,
    entry_count: u64,
    midpoints: Vec<Midpoint>,
}

impl PTable {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Write a sorted entry run to `path` (via temp-and-rename) and open it.
    pub fn write(
        path: &Path,
        entries: &[PTableEntry],
        midpoint_interval: usize,
    ) -> IndexResult<PTable> {
        debug_assert!(
            entries.windows(2).all(|w| w[0].key() <= w[1].key()),
            "ptable entries must be sorted"
        );
        let midpoint_interval = midpoint_interval.max(1);

        let tmp_path = path.with_extension("tmp");
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(|source| IndexError::io(&tmp_path, source))?;
        let mut writer = BufWriter::new(file);

        let mut midpoints = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            if i % midpoint_interval == 0 {
                midpoints.push(Midpoint {
                    key: entry.key(),
                    entry_index: i as u64,
                });
            }
        }

        let mut header = [0u8; PTABLE_HEADER_LEN];
        header[0..4].copy_from_slice(&PTABLE_MAGIC.to_le_bytes());
        header[4] = PTABLE_VERSION;
        header[5] = HASH_ALGO_SHA256_64;
        // bytes 6..8 reserved
        header[8..16].copy_from_slice(&(entries.len() as u64).to_le_bytes());
        header[16..20].copy_from_slice(&(midpoints.len() as u32).to_le_bytes());
        // bytes 20..28 reserved
        let crc = crc32c(&header[0..28]);
        header[28..32].copy_from_slice(&crc.to_le_bytes());
        writer
            .write_all(&header)
            .map_err(|source| IndexError::io(&tmp_path, source))?;

        for entry in entries {
            writer
                .write_all(&entry.encode())
                .map_err(|source| IndexError::io(&tmp_path, source))?;
        }
        for midpoint in &midpoints {
            let mut buf = [0u8; PTABLE_ENTRY_LEN];
            buf[0..8].copy_from_slice(&midpoint.key.0.to_le_bytes());
            buf[8..16].copy_from_slice(&midpoint.key.1.to_le_bytes());
            buf[16..24].copy_from_slice(&midpoint.entry_index.to_le_bytes());
            writer
                .write_all(&buf)
                .map_err(|source| IndexError::io(&tmp_path, source))?;
        }

        let file = writer
            .into_inner()
            .map_err(|err| IndexError::io(&tmp_path, err.into_error()))?;
        file.sync_all()
            .map_err(|source| IndexError::io(&tmp_path, source))?;
        drop(file);
        fs::rename(&tmp_path, path).map_err(|source| IndexError::io(path, source))?;

        Ok(PTable {
            path: path.to_path_buf(),
            entry_count: entries.len() as u64,
            midpoints,
        })
    }

    pub fn open(path: &Path) -> IndexResult<PTable> {
        let mut file = File::open(path).map_err(|source| IndexError::io(path, source))?;
        let mut header = [0u8; PTABLE_HEADER_LEN];
        file.read_exact(&mut header)
            .map_err(|source| IndexError::io(path, source))?;

        let magic = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        if magic != PTABLE_MAGIC {
            return Err(IndexError::TableInvalid {
                path: path.to_path_buf(),
                reason: format!("bad magic {magic:#x}"),
            });
        }
        if header[4] != PTABLE_VERSION {
            return Err(IndexError::TableInvalid {
                path: path.to_path_buf(),
                reason: format!("unsupported version {}", header[4]),
            });
        }
        if header[5] != HASH_ALGO_SHA256_64 {
            return Err(IndexError::TableInvalid {
                path: path.to_path_buf(),
                reason: format!("unsupported hash algorithm {}", header[5]),
            });
        }
        let expected_crc = u32::from_le_bytes(header[28..32].try_into().expect("4 bytes"));
        let actual_crc = crc32c(&header[0..28]);
        if expected_crc != actual_crc {
            return Err(IndexError::TableInvalid {
                path: path.to_path_buf(),
                reason: format!("header crc mismatch ({expected_crc:#x} vs {actual_crc:#x})"),
            });
        }

        let entry_count = u64::from_le_bytes(header[8..16].try_into().expect("8 bytes"));
        let midpoint_count = u32::from_le_bytes(header[16..20].try_into().expect("4 bytes"));

        let midpoint_offset = PTABLE_HEADER_LEN as u64 + entry_count * PTABLE_ENTRY_LEN as u64;
        file.seek(SeekFrom::Start(midpoint_offset))
            .map_err(|source| IndexError::io(path, source))?;
        let mut midpoints = Vec::with_capacity(midpoint_count as usize);
        let mut buf = [0u8; PTABLE_ENTRY_LEN];
        for _ in 0..midpoint_count {
            file.read_exact(&mut buf)
                .map_err(|source| IndexError::io(path, source))?;
            midpoints.push(Midpoint {
                key: (
                    u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes")),
                    i64::from_le_bytes(buf[8..16].try_into().expect("8 bytes")),
                ),
                entry_index: u64::from_le_bytes(buf[16..24].try_into().expect("8 bytes")),
            });
        }

        Ok(PTable {
            path: path.to_path_buf(),
            entry_count,
            midpoints,
        })
    }

    /// Entry indices `[lo, hi)` that could contain `key`, per the midpoints.
    fn window(&self, key: (u64, i64)) -> (u64, u64) {
        if self.midpoints.is_empty() {
            return (0, self.entry_count);
        }
        // Start strictly below the key: duplicates of the key may span a
        // midpoint boundary.
        let start_idx = self.midpoints.partition_point(|m| m.key < key);
        let lo = if start_idx == 0 {
            0
        } else {
            self.midpoints[start_idx - 1].entry_index
        };
        let end_idx = self.midpoints.partition_point(|m| m.key <= key);
        let hi = self
            .midpoints
            .get(end_idx)
            .map(|m| m.entry_index)
            .unwrap_or(self.entry_count);
        (lo, hi)
    }

    fn read_entries(&self, lo: u64, hi: u64) -> IndexResult<Vec<PTableEntry>> {
        let count = hi.saturating_sub(lo) as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut file = File::open(&self.path).map_err(|source| IndexError::io(&self.path, source))?;
        file.seek(SeekFrom::Start(
            PTABLE_HEADER_LEN as u64 + lo * PTABLE_ENTRY_LEN as u64,
        ))
        .map_err(|source| IndexError::io(&self.path, source))?;
        let mut raw = vec![0u8; count * PTABLE_ENTRY_LEN];
        file.read_exact(&mut raw)
            .map_err(|source| IndexError::io(&self.path, source))?;
        Ok(raw
            .chunks_exact(PTABLE_ENTRY_LEN)
            .map(PTableEntry::decode)
            .collect())
    }

    /// Candidate positions for an exact key. More than one only on hash
    /// collisions.
    pub fn get(&self, stream_hash: u64, event_number: i64) -> IndexResult<Vec<i64>> {
        let key = (stream_hash, event_number);
        let (lo, hi) = self.window(key);
        let entries = self.read_entries(lo, hi)?;
        Ok(entries
            .iter()
            .filter(|entry| entry.key() == key)
            .map(|entry| entry.position)
            .collect())
    }

    /// All entries for a hash within `[from, to]`, ascending.
    pub fn range(&self, stream_hash: u64, from: i64, to: i64) -> IndexResult<Vec<PTableEntry>> {
        if from > to {
            return Ok(Vec::new());
        }
        let (lo, _) = self.window((stream_hash, from));
        let mut out = Vec::new();
        let mut cursor = lo;
        const BATCH: u64 = 256;
        loop {
            let hi = (cursor + BATCH).min(self.entry_count);
            if cursor >= hi {
                break;
            }
            let entries = self.read_entries(cursor, hi)?;
            let mut done = false;
            for entry in &entries {
                if entry.key() > (stream_hash, to) {
                    done = true;
                    break;
                }
                if entry.stream_hash == stream_hash && entry.event_number >= from {
                    out.push(*entry);
                }
            }
            if done || hi == self.entry_count {
                break;
            }
            cursor = hi;
        }
        Ok(out)
    }

    /// Greatest entry for a hash strictly below `bound`, if any.
    pub fn last_below(&self, stream_hash: u64, bound: i64) -> IndexResult<Option<PTableEntry>> {
        let key = (stream_hash, bound);
        let (lo, hi) = self.window(key);
        let entries = self.read_entries(lo, hi.min(self.entry_count))?;
        let idx = entries.partition_point(|e| e.key() < key);
        Ok(entries[..idx]
            .iter()
            .rev()
            .find(|e| e.stream_hash == stream_hash)
            .copied())
    }

    /// Sequential iterator for merges.
    pub fn iter(&self) -> IndexResult<PTableIter> {
        let mut file = File::open(&self.path).map_err(|source| IndexError::io(&self.path, source))?;
        file.seek(SeekFrom::Start(PTABLE_HEADER_LEN as u64))
            .map_err(|source| IndexError::io(&self.path, source))?;
        Ok(PTableIter {
            reader: BufReader::new(file),
            path: self.path.clone(),
            remaining: self.entry_count,
        })
    }
}

pub struct PTableIter {
    reader: BufReader<File>,
    path: PathBuf,
    remaining: u64,
}

impl Iterator for PTableIter {
    type Item = IndexResult<PTableEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let mut buf = [0u8; PTABLE_ENTRY_LEN];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {
                self.remaining -= 1;
                Some(Ok(PTableEntry::decode(&buf)))
            }
            Err(source) => {
                self.remaining = 0;
                Some(Err(IndexError::io(&self.path, source)))
            }
        }
    }
}
