//! Point and range reads over streams and the global order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;

use crate::core::{
    EventNumber, EventRecord, Limits, LogPosition, ResolvedEvent, StreamId, StreamMetadata,
    METADATA_EVENT_TYPE,
};
use crate::error::Transience;
use crate::index::{IndexError, StreamIndex};
use crate::log::{LogError, LogReader, LogRecord};

mod all;
mod streams;

pub type ReadResult<T> = Result<T, ReadError>;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("reader cache lock poisoned")]
    LockPoisoned,
}

impl ReadError {
    pub fn transience(&self) -> Transience {
        match self {
            ReadError::Log(err) => err.transience(),
            ReadError::Index(err) => err.transience(),
            ReadError::LockPoisoned => Transience::Permanent,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

/// Result of a single-event read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadEventResult {
    Found(ResolvedEvent),
    NotFound,
    NoStream,
    StreamDeleted,
}

/// A bounded slice of a stream.
#[derive(Clone, Debug)]
pub struct StreamSlice {
    pub events: Vec<ResolvedEvent>,
    /// Where the next read in the same direction continues; `None` when a
    /// backward read ran past the first visible event.
    pub next_event_number: Option<EventNumber>,
    /// The stream tail at read time.
    pub last_event_number: EventNumber,
    pub is_end_of_stream: bool,
    pub direction: ReadDirection,
}

/// Stream read outcome, tombstone- and existence-aware.
#[derive(Clone, Debug)]
pub enum StreamReadOutcome {
    Slice(StreamSlice),
    NoStream,
    StreamDeleted,
}

impl StreamReadOutcome {
    pub fn into_slice(self) -> Option<StreamSlice> {
        match self {
            StreamReadOutcome::Slice(slice) => Some(slice),
            _ => None,
        }
    }
}

/// A bounded slice of the global order.
#[derive(Clone, Debug)]
pub struct AllSlice {
    pub events: Vec<EventRecord>,
    /// Resume position for the next read in the same direction.
    pub next_position: LogPosition,
    pub is_end_of_stream: bool,
}

struct CachedMetadata {
    metadata: StreamMetadata,
    fetched: Instant,
}

/// Shared read front-end over the log and the stream index.
pub struct Reader {
    log: LogReader,
    index: Arc<StreamIndex>,
    limits: Limits,
    metadata_cache: Mutex<HashMap<StreamId, CachedMetadata>>,
}

impl Reader {
    pub fn new(log: LogReader, index: Arc<StreamIndex>, limits: Limits) -> Self {
        Self {
            log,
            index,
            limits,
            metadata_cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn log(&self) -> &LogReader {
        &self.log
    }

    pub(crate) fn index(&self) -> &StreamIndex {
        &self.index
    }

    /// Current exclusive end of the readable log.
    pub fn end_position(&self) -> LogPosition {
        LogPosition::single(self.log.end_position())
    }

    /// Materialize the committed event whose prepare sits at `position`.
    /// Returns `None` for non-event records.
    pub(crate) fn materialize(&self, position: i64) -> ReadResult<Option<EventRecord>> {
        let at = self.log.read_at(position)?;
        let LogRecord::Prepare(prepare) = at.record else {
            return Ok(None);
        };
        let log_position = self.log.resolve_event_position(&prepare, position)?;
        Ok(Some(event_record_from_prepare(prepare, log_position)))
    }

    /// Stream metadata with a small TTL cache; `$cacheControl` overrides the
    /// configured TTL.
    pub fn stream_metadata(&self, stream: &StreamId) -> ReadResult<StreamMetadata> {
        if stream.is_metadata() {
            return Ok(StreamMetadata::default());
        }
        {
            let cache = self
                .metadata_cache
                .lock()
                .map_err(|_| ReadError::LockPoisoned)?;
            if let Some(cached) = cache.get(stream) {
                let ttl_ms = cached
                    .metadata
                    .cache_control_ms
                    .unwrap_or(self.limits.metadata_cache_ttl_ms);
                if (cached.fetched.elapsed().as_millis() as u64) < ttl_ms {
                    return Ok(cached.metadata.clone());
                }
            }
        }

        let metadata = self.load_metadata(stream)?;
        let mut cache = self
            .metadata_cache
            .lock()
            .map_err(|_| ReadError::LockPoisoned)?;
        cache.insert(
            stream.clone(),
            CachedMetadata {
                metadata: metadata.clone(),
                fetched: Instant::now(),
            },
        );
        Ok(metadata)
    }

    fn load_metadata(&self, stream: &StreamId) -> ReadResult<StreamMetadata> {
        let metadata_stream = stream.metadata_stream();
        let tail = match self.index.tail(&metadata_stream)? {
            crate::core::CurrentVersion::Version(tail) => tail,
            _ => return Ok(StreamMetadata::default()),
        };
        // Walk back from the tail to the most recent `$metadata` event.
        let mut number = Some(tail);
        while let Some(current) = number {
            let Some(position) = self.index.lookup(&metadata_stream, current)? else {
                break;
            };
            if let Some(record) = self.materialize(position)? {
                if record.event_type == METADATA_EVENT_TYPE {
                    if let Ok(metadata) = StreamMetadata::from_json_bytes(&record.data) {
                        return Ok(metadata);
                    }
                }
            }
            number = current.prev();
        }
        Ok(StreamMetadata::default())
    }
}

pub(crate) fn event_record_from_prepare(
    prepare: crate::log::PrepareLog,
    position: LogPosition,
) -> EventRecord {
    use crate::log::PrepareFlags;
    EventRecord {
        is_json: prepare.flags.contains(PrepareFlags::IS_JSON),
        stream: prepare.stream,
        event_number: prepare.event_number,
        event_id: prepare.event_id,
        event_type: prepare.event_type,
        data: prepare.data,
        metadata: prepare.metadata,
        created_ms: prepare.created_ms,
        position,
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
