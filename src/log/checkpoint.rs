//! Named checkpoint files, updated atomically via write-then-rename.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32c::crc32c;

use super::chunk::fsync_dir;
use super::{LogError, LogResult};

pub const WRITER_CHECKPOINT: &str = "writer.chk";
pub const CHASER_CHECKPOINT: &str = "chaser.chk";
pub const EPOCH_CHECKPOINT: &str = "epoch.chk";
pub const TRUNCATE_CHECKPOINT: &str = "truncate.chk";

const CHECKPOINT_LEN: usize = 12;

/// A single persisted i64 with a crc32c trailer.
#[derive(Debug)]
pub struct NamedCheckpoint {
    name: &'static str,
    dir: PathBuf,
    path: PathBuf,
}

impl NamedCheckpoint {
    pub fn open(dir: &Path, name: &'static str) -> Self {
        Self {
            name,
            dir: dir.to_path_buf(),
            path: dir.join(name),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `None` when the checkpoint file does not exist yet.
    pub fn read(&self) -> LogResult<Option<i64>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(LogError::io(&self.path, err)),
        };
        let mut buf = [0u8; CHECKPOINT_LEN];
        file.read_exact(&mut buf)
            .map_err(|source| LogError::CheckpointInvalid {
                path: self.path.clone(),
                reason: format!("short read: {source}"),
            })?;
        let value = i64::from_le_bytes(buf[0..8].try_into().expect("8 bytes"));
        let expected = u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes"));
        let actual = crc32c(&buf[0..8]);
        if actual != expected {
            return Err(LogError::CheckpointInvalid {
                path: self.path.clone(),
                reason: format!("crc mismatch (expected {expected:#x}, got {actual:#x})"),
            });
        }
        Ok(Some(value))
    }

    pub fn read_or(&self, default: i64) -> LogResult<i64> {
        Ok(self.read()?.unwrap_or(default))
    }

    pub fn write(&self, value: i64) -> LogResult<()> {
        let mut buf = [0u8; CHECKPOINT_LEN];
        buf[0..8].copy_from_slice(&value.to_le_bytes());
        let crc = crc32c(&buf[0..8]);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());

        let tmp_path = self.dir.join(format!("{}.tmp", self.name));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|source| LogError::io(&tmp_path, source))?;
        file.write_all(&buf)
            .map_err(|source| LogError::io(&tmp_path, source))?;
        file.sync_all()
            .map_err(|source| LogError::io(&tmp_path, source))?;
        fs::rename(&tmp_path, &self.path).map_err(|source| LogError::io(&self.path, source))?;
        fsync_dir(&self.dir)
    }
}
