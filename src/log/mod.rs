//! Chunked append-only transaction log.

use std::path::PathBuf;

use thiserror::Error;

use crate::error::Transience;

pub mod checkpoint;
pub mod chunk;
pub mod frame;
pub mod reader;
pub mod record;
pub mod recovery;
pub mod writer;

pub use checkpoint::NamedCheckpoint;
pub use chunk::{ChunkFooter, ChunkHeader, ChunkId, ChunkInfo, CHUNK_FOOTER_LEN, CHUNK_HEADER_LEN};
pub use frame::{encode_frame, FrameReader};
pub use reader::{LogReader, RecordAt};
pub use record::{CommitLog, LogRecord, PrepareFlags, PrepareLog, SystemLog, SystemRecordKind};
pub use recovery::RecoveryReport;
pub use writer::ChunkedLog;

pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("record exceeds max bytes {max_bytes} (got {got_bytes})")]
    RecordTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame torn: {reason}")]
    FrameTorn { reason: String },
    #[error("frame suffix mismatch (prefix {prefix}, suffix {suffix})")]
    FrameSuffixMismatch { prefix: u32, suffix: u32 },
    #[error("record invalid: {reason}")]
    RecordInvalid { reason: String },
    #[error("chunk header invalid: {reason}")]
    ChunkHeaderInvalid { reason: String },
    #[error("chunk magic mismatch: got {got:#x}")]
    ChunkMagicMismatch { got: u32 },
    #[error("chunk format unsupported: got {got}, supported {supported}")]
    ChunkVersionUnsupported { got: u8, supported: u8 },
    #[error("chunk footer invalid: {reason}")]
    ChunkFooterInvalid { reason: String },
    #[error("chunk {chunk} data hash mismatch")]
    ChunkHashMismatch { chunk: u32 },
    #[error("no chunk covers log position {position}")]
    PositionOutOfRange { position: i64 },
    #[error("checkpoint file invalid at {path:?}: {reason}")]
    CheckpointInvalid { path: PathBuf, reason: String },
    #[error("path is a symlink: {path:?}")]
    Symlink { path: PathBuf },
    #[error("log state lock poisoned")]
    LockPoisoned,
}

impl LogError {
    pub fn transience(&self) -> Transience {
        match self {
            LogError::Io { .. } => Transience::Unknown,
            LogError::RecordTooLarge { .. }
            | LogError::FrameLengthInvalid { .. }
            | LogError::FrameTorn { .. }
            | LogError::FrameSuffixMismatch { .. }
            | LogError::RecordInvalid { .. }
            | LogError::ChunkHeaderInvalid { .. }
            | LogError::ChunkMagicMismatch { .. }
            | LogError::ChunkVersionUnsupported { .. }
            | LogError::ChunkFooterInvalid { .. }
            | LogError::ChunkHashMismatch { .. }
            | LogError::PositionOutOfRange { .. }
            | LogError::CheckpointInvalid { .. }
            | LogError::Symlink { .. }
            | LogError::LockPoisoned => Transience::Permanent,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LogError::Io {
            path: Some(path.into()),
            source,
        }
    }
}
