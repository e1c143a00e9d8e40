//! Two-tier stream index: in-memory memtable over immutable sorted tables.

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::StreamId;
use crate::error::Transience;
use crate::log::LogError;

pub mod manifest;
pub mod memtable;
pub mod merge;
pub mod ptable;
pub mod recover;
pub mod stream_index;

pub use manifest::Manifest;
pub use ptable::{PTable, PTableEntry};
pub use recover::{catch_up_index, ReplayStats};
pub use stream_index::{RecordResolver, StreamIndex};

pub type IndexResult<T> = Result<T, IndexError>;

/// Hash algorithm id 1: first eight little-endian bytes of SHA-256.
pub const HASH_ALGO_SHA256_64: u8 = 1;

pub fn stream_hash(stream: &StreamId) -> u64 {
    let digest = Sha256::digest(stream.as_str().as_bytes());
    u64::from_le_bytes(digest[0..8].try_into().expect("8 bytes"))
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("index table invalid at {path:?}: {reason}")]
    TableInvalid { path: PathBuf, reason: String },
    #[error("index manifest invalid at {path:?}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },
    #[error(
        "conflicting index entry for {stream} event {event_number} \
         (existing position {existing}, new {new})"
    )]
    ConflictingEntry {
        stream: StreamId,
        event_number: i64,
        existing: i64,
        new: i64,
    },
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("index state lock poisoned")]
    LockPoisoned,
}

impl IndexError {
    pub fn transience(&self) -> Transience {
        match self {
            IndexError::Io { .. } => Transience::Unknown,
            IndexError::Log(err) => err.transience(),
            IndexError::TableInvalid { .. }
            | IndexError::ManifestInvalid { .. }
            | IndexError::ConflictingEntry { .. }
            | IndexError::LockPoisoned => Transience::Permanent,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Io {
            path: Some(path.into()),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_hash_is_stable() {
        let stream = StreamId::parse("orders-1").unwrap();
        let first = stream_hash(&stream);
        let second = stream_hash(&stream);
        assert_eq!(first, second);
        assert_ne!(first, stream_hash(&StreamId::parse("orders-2").unwrap()));
    }
}
