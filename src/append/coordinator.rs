//! The append coordinator: one writer, optimistic concurrency, idempotent
//! replay, and commit publication.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::config::{DurabilityConfig, WriteMode};
use crate::core::{
    CurrentVersion, EventId, EventNumber, EventRecord, ExpectedVersion, Limits, LogPosition,
    ProposedEvent, StreamId, StreamMetadata, METADATA_EVENT_TYPE,
};
use crate::error::Transience;
use crate::index::{IndexError, StreamIndex};
use crate::log::{
    ChunkedLog, CommitLog, LogError, LogReader, LogRecord, PrepareFlags, PrepareLog,
};

use super::commit_bus::{CommitBus, Committed};

/// Event type written by a hard delete.
pub const STREAM_DELETED_EVENT_TYPE: &str = "$streamDeleted";

#[derive(Debug, Error)]
pub enum AppendError {
    #[error("stream {stream} is deleted")]
    StreamDeleted { stream: StreamId },
    #[error("wrong expected version on {stream}: expected {expected}, current {current}")]
    WrongExpectedVersion {
        stream: StreamId,
        expected: ExpectedVersion,
        current: CurrentVersion,
    },
    #[error("append batch cannot be empty")]
    EmptyBatch,
    #[error("stream metadata invalid: {source}")]
    InvalidMetadata {
        #[source]
        source: serde_json::Error,
    },
    #[error("commit timed out: {reason}")]
    CommitTimeout { reason: String },
    #[error(transparent)]
    Log(LogError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

impl AppendError {
    pub fn transience(&self) -> Transience {
        match self {
            AppendError::StreamDeleted { .. }
            | AppendError::WrongExpectedVersion { .. }
            | AppendError::EmptyBatch
            | AppendError::InvalidMetadata { .. } => Transience::Permanent,
            AppendError::CommitTimeout { .. } => Transience::Retryable,
            AppendError::Log(err) => err.transience(),
            AppendError::Index(err) => err.transience(),
        }
    }
}

impl From<LogError> for AppendError {
    fn from(err: LogError) -> Self {
        // Disk trouble mid-append is indistinguishable from a lost commit;
        // surface it as a timeout the client resolves by re-reading.
        match err {
            LogError::Io { .. } => AppendError::CommitTimeout {
                reason: err.to_string(),
            },
            other => AppendError::Log(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendOutcome {
    pub first_event_number: EventNumber,
    pub last_event_number: EventNumber,
    /// Position of the batch's commit record (the prepare itself for a
    /// single-event append).
    pub position: LogPosition,
    /// True when the batch was an idempotent replay and no bytes were
    /// written.
    pub idempotent: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub position: LogPosition,
}

struct WriterCore {
    log: ChunkedLog,
}

pub struct AppendCoordinator {
    writer: Mutex<WriterCore>,
    index: Arc<StreamIndex>,
    bus: CommitBus,
    reader: LogReader,
    mode: WriteMode,
    batch_flush_bytes: u64,
}

impl AppendCoordinator {
    pub fn new(
        log: ChunkedLog,
        index: Arc<StreamIndex>,
        bus: CommitBus,
        durability: &DurabilityConfig,
        limits: &Limits,
    ) -> Self {
        let reader = log.reader();
        Self {
            writer: Mutex::new(WriterCore { log }),
            index,
            bus,
            reader,
            mode: durability.mode,
            batch_flush_bytes: limits.batch_flush_bytes,
        }
    }

    pub fn bus(&self) -> &CommitBus {
        &self.bus
    }

    pub fn log_reader(&self) -> LogReader {
        self.reader.clone()
    }

    pub fn write_position(&self) -> Result<i64, AppendError> {
        let writer = self.lock_writer()?;
        Ok(writer.log.write_position())
    }

    /// Append a batch to a stream under an expected-version claim.
    pub fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: &[ProposedEvent],
    ) -> Result<AppendOutcome, AppendError> {
        if events.is_empty() {
            return Err(AppendError::EmptyBatch);
        }

        let mut writer = self.lock_writer()?;
        let current = self.check_writable(stream)?;
        let tail = current.as_event_number();

        match self.check_expected(stream, expected, current, events)? {
            VersionCheck::Proceed => {}
            VersionCheck::Idempotent(outcome) => return Ok(outcome),
        }

        let first = tail.map(|t| t.next()).unwrap_or(EventNumber::ZERO);
        let created_ms = now_ms();
        let (prepare_positions, commit_position) =
            self.write_batch(&mut writer.log, stream, first, events, created_ms)?;
        self.apply_durability(&mut writer.log)?;

        for (i, position) in prepare_positions.iter().enumerate() {
            let number = EventNumber::new(first.get() + i as i64).expect("dense numbering");
            self.index.insert(stream, number, *position)?;
            self.apply_metadata_side_effects(stream, &events[i])?;
        }
        self.index.set_covered(writer.log.write_position())?;

        let last =
            EventNumber::new(first.get() + events.len() as i64 - 1).expect("dense numbering");
        for (i, position) in prepare_positions.iter().enumerate() {
            let number = EventNumber::new(first.get() + i as i64).expect("dense numbering");
            let event = &events[i];
            let record = EventRecord {
                stream: stream.clone(),
                event_number: number,
                event_id: event.event_id,
                event_type: event.event_type.clone(),
                is_json: event.is_json,
                data: event.data.clone(),
                metadata: event.metadata.clone(),
                created_ms,
                position: LogPosition {
                    commit: commit_position,
                    prepare: *position,
                },
            };
            let _ = self.bus.publish(Committed {
                event: record,
                first_event_number: first,
            });
        }

        tracing::debug!(
            stream = %stream,
            first = first.get(),
            count = events.len(),
            commit = commit_position,
            "batch appended"
        );

        Ok(AppendOutcome {
            first_event_number: first,
            last_event_number: last,
            position: LogPosition {
                commit: commit_position,
                prepare: *prepare_positions.last().expect("non-empty batch"),
            },
            idempotent: false,
        })
    }

    /// Delete a stream. `hard` writes an irreversible tombstone; soft delete
    /// truncates via metadata so the stream may be recreated.
    pub fn delete_stream(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        hard: bool,
    ) -> Result<DeleteOutcome, AppendError> {
        if !hard {
            let tail = {
                let _writer = self.lock_writer()?;
                let current = self.check_writable(stream)?;
                self.ensure_expected(stream, expected, current)?;
                match current {
                    CurrentVersion::Version(tail) => tail,
                    current => {
                        return Err(AppendError::WrongExpectedVersion {
                            stream: stream.clone(),
                            expected,
                            current,
                        })
                    }
                }
            };
            let metadata = StreamMetadata {
                truncate_before: Some(tail.next()),
                ..StreamMetadata::default()
            };
            let outcome = self.set_stream_metadata(stream, ExpectedVersion::Any, &metadata)?;
            return Ok(DeleteOutcome {
                position: outcome.position,
            });
        }

        let mut writer = self.lock_writer()?;
        let current = self.check_writable(stream)?;
        self.ensure_expected(stream, expected, current)?;

        let created_ms = now_ms();
        let transaction_position = writer.log.write_position();
        let prepare = PrepareLog {
            flags: PrepareFlags::TRANSACTION_BEGIN
                .with(PrepareFlags::TRANSACTION_END)
                .with(PrepareFlags::IMPLICIT_COMMIT)
                .with(PrepareFlags::TOMBSTONE),
            transaction_position,
            transaction_offset: 0,
            stream: stream.clone(),
            event_number: EventNumber::TOMBSTONE,
            event_id: EventId::generate(),
            event_type: STREAM_DELETED_EVENT_TYPE.to_string(),
            created_ms,
            data: bytes::Bytes::new(),
            metadata: bytes::Bytes::new(),
        };
        let position = writer.log.append(&LogRecord::Prepare(prepare.clone()))?;
        // Tombstones are always made durable before acknowledging.
        writer.log.flush()?;
        self.index.mark_deleted(stream, position)?;
        self.index.set_covered(writer.log.write_position())?;

        let record = EventRecord {
            stream: stream.clone(),
            event_number: EventNumber::TOMBSTONE,
            event_id: prepare.event_id,
            event_type: STREAM_DELETED_EVENT_TYPE.to_string(),
            is_json: false,
            data: bytes::Bytes::new(),
            metadata: bytes::Bytes::new(),
            created_ms,
            position: LogPosition::single(position),
        };
        let _ = self.bus.publish(Committed {
            event: record,
            first_event_number: EventNumber::TOMBSTONE,
        });

        tracing::info!(stream = %stream, position, "stream hard-deleted");
        Ok(DeleteOutcome {
            position: LogPosition::single(position),
        })
    }

    /// Write stream metadata as a `$metadata` event on `$$stream`.
    pub fn set_stream_metadata(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        metadata: &StreamMetadata,
    ) -> Result<AppendOutcome, AppendError> {
        let body = metadata
            .to_json_bytes()
            .map_err(|source| AppendError::InvalidMetadata { source })?;
        let event = ProposedEvent::json(
            EventId::generate(),
            METADATA_EVENT_TYPE,
            bytes::Bytes::from(body),
        );
        self.append(&stream.metadata_stream(), expected, &[event])
    }

    pub fn flush(&self) -> Result<(), AppendError> {
        let mut writer = self.lock_writer()?;
        writer.log.flush()?;
        Ok(())
    }

    /// Final flush of log and index state.
    pub fn shutdown(&self) -> Result<(), AppendError> {
        let mut writer = self.lock_writer()?;
        writer.log.flush()?;
        self.index.flush()?;
        tracing::info!(
            write_position = writer.log.write_position(),
            "append coordinator stopped"
        );
        Ok(())
    }

    /// Tombstone check shared by every write path. Writing metadata for a
    /// tombstoned stream is also refused.
    fn check_writable(&self, stream: &StreamId) -> Result<CurrentVersion, AppendError> {
        if let Some(data_stream) = stream.data_stream() {
            if self.index.tail(&data_stream)? == CurrentVersion::Deleted {
                return Err(AppendError::StreamDeleted {
                    stream: data_stream,
                });
            }
        }
        let current = self.index.tail(stream)?;
        if current == CurrentVersion::Deleted {
            return Err(AppendError::StreamDeleted {
                stream: stream.clone(),
            });
        }
        Ok(current)
    }

    /// Expected-version check without idempotency (delete paths).
    fn ensure_expected(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        current: CurrentVersion,
    ) -> Result<(), AppendError> {
        let ok = match expected {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current.as_event_number().is_none(),
            ExpectedVersion::StreamExists => current.as_event_number().is_some(),
            ExpectedVersion::Exact(n) => current.as_event_number() == Some(n),
        };
        if ok {
            Ok(())
        } else {
            Err(AppendError::WrongExpectedVersion {
                stream: stream.clone(),
                expected,
                current,
            })
        }
    }

    fn check_expected(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        current: CurrentVersion,
        events: &[ProposedEvent],
    ) -> Result<VersionCheck, AppendError> {
        let tail = current.as_event_number();
        let conflict = || AppendError::WrongExpectedVersion {
            stream: stream.clone(),
            expected,
            current,
        };

        match expected {
            ExpectedVersion::Any => {
                // Best-effort: a tail that ends with the batch's last id is
                // examined for a full replay; anything partial conflicts.
                if let Some(tail) = tail {
                    if let Some(outcome) =
                        self.try_idempotent(stream, expected, current, tail, events)?
                    {
                        return Ok(outcome);
                    }
                }
                Ok(VersionCheck::Proceed)
            }
            ExpectedVersion::NoStream => match tail {
                None => Ok(VersionCheck::Proceed),
                Some(tail) => self
                    .try_idempotent(stream, expected, current, tail, events)?
                    .ok_or_else(conflict),
            },
            ExpectedVersion::StreamExists => {
                if tail.is_some() {
                    Ok(VersionCheck::Proceed)
                } else {
                    Err(conflict())
                }
            }
            ExpectedVersion::Exact(n) => match tail {
                Some(tail) if tail == n => Ok(VersionCheck::Proceed),
                Some(tail) => self
                    .try_idempotent(stream, expected, current, tail, events)?
                    .ok_or_else(conflict),
                None => Err(conflict()),
            },
        }
    }

    /// Idempotent replay: the batch's event ids exactly match the tail block
    /// the batch would have produced. A partial prefix match is a conflict,
    /// never a partial success.
    fn try_idempotent(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        current: CurrentVersion,
        tail: EventNumber,
        events: &[ProposedEvent],
    ) -> Result<Option<VersionCheck>, AppendError> {
        let len = events.len() as i64;
        let first = match expected {
            ExpectedVersion::NoStream => 0,
            ExpectedVersion::Exact(n) => n.get() + 1,
            // `Any`: best effort, assuming the batch is the tail block.
            _ => tail.get() - len + 1,
        };
        if first < 0 || tail.get() != first + len - 1 {
            return Ok(None);
        }

        let mut matched = 0usize;
        let mut last_position = None;
        for (i, event) in events.iter().enumerate() {
            let number = EventNumber::new(first + i as i64).expect("non-negative");
            let Some(position) = self.index.lookup(stream, number)? else {
                break;
            };
            let Some((existing_id, log_position)) = self.event_id_at(position)? else {
                break;
            };
            if existing_id != event.event_id {
                break;
            }
            matched += 1;
            last_position = Some(log_position);
        }

        if matched == events.len() {
            let outcome = AppendOutcome {
                first_event_number: EventNumber::new(first).expect("non-negative"),
                last_event_number: tail,
                position: last_position.expect("matched batch is non-empty"),
                idempotent: true,
            };
            tracing::debug!(
                stream = %stream,
                first,
                count = events.len(),
                "idempotent replay detected"
            );
            return Ok(Some(VersionCheck::Idempotent(outcome)));
        }
        if matched > 0 {
            // Some ids line up but not all: refuse rather than re-append.
            return Err(AppendError::WrongExpectedVersion {
                stream: stream.clone(),
                expected,
                current,
            });
        }
        Ok(None)
    }

    fn event_id_at(&self, position: i64) -> Result<Option<(EventId, LogPosition)>, AppendError> {
        let at = self.reader.read_at(position)?;
        match at.record {
            LogRecord::Prepare(prepare) => {
                let log_position = self.reader.resolve_event_position(&prepare, position)?;
                Ok(Some((prepare.event_id, log_position)))
            }
            _ => Ok(None),
        }
    }

    /// Lay the batch down: one implicit-commit prepare for a single event,
    /// prepares plus a commit record otherwise. Returns the prepare
    /// positions and the commit position.
    fn write_batch(
        &self,
        log: &mut ChunkedLog,
        stream: &StreamId,
        first: EventNumber,
        events: &[ProposedEvent],
        created_ms: u64,
    ) -> Result<(Vec<i64>, i64), AppendError> {
        let transaction_position = log.write_position();

        if events.len() == 1 {
            let event = &events[0];
            let mut flags = PrepareFlags::DATA
                .with(PrepareFlags::TRANSACTION_BEGIN)
                .with(PrepareFlags::TRANSACTION_END)
                .with(PrepareFlags::IMPLICIT_COMMIT);
            if event.is_json {
                flags = flags.with(PrepareFlags::IS_JSON);
            }
            let prepare = PrepareLog {
                flags,
                transaction_position,
                transaction_offset: 0,
                stream: stream.clone(),
                event_number: first,
                event_id: event.event_id,
                event_type: event.event_type.clone(),
                created_ms,
                data: event.data.clone(),
                metadata: event.metadata.clone(),
            };
            let position = log.append(&LogRecord::Prepare(prepare))?;
            return Ok((vec![position], position));
        }

        let mut positions = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            let mut flags = PrepareFlags::DATA;
            if i == 0 {
                flags = flags.with(PrepareFlags::TRANSACTION_BEGIN);
            }
            if i == events.len() - 1 {
                flags = flags.with(PrepareFlags::TRANSACTION_END);
            }
            if event.is_json {
                flags = flags.with(PrepareFlags::IS_JSON);
            }
            let prepare = PrepareLog {
                flags,
                transaction_position,
                transaction_offset: i as i32,
                stream: stream.clone(),
                event_number: EventNumber::new(first.get() + i as i64)
                    .expect("dense numbering"),
                event_id: event.event_id,
                event_type: event.event_type.clone(),
                created_ms,
                data: event.data.clone(),
                metadata: event.metadata.clone(),
            };
            positions.push(log.append(&LogRecord::Prepare(prepare))?);
        }
        let commit_position = log.append(&LogRecord::Commit(CommitLog {
            transaction_position,
            first_event_number: first,
        }))?;
        Ok((positions, commit_position))
    }

    fn apply_durability(&self, log: &mut ChunkedLog) -> Result<(), AppendError> {
        match self.mode {
            WriteMode::Synchronous => log.flush()?,
            WriteMode::Batched => {
                if log.unflushed_bytes() >= self.batch_flush_bytes {
                    log.flush()?;
                }
            }
        }
        Ok(())
    }

    /// `$metadata` writes adjust the scavenge watermark of the described
    /// stream.
    fn apply_metadata_side_effects(
        &self,
        stream: &StreamId,
        event: &ProposedEvent,
    ) -> Result<(), AppendError> {
        if !stream.is_metadata() || event.event_type != METADATA_EVENT_TYPE {
            return Ok(());
        }
        let Some(data_stream) = stream.data_stream() else {
            return Ok(());
        };
        if let Ok(metadata) = StreamMetadata::from_json_bytes(&event.data) {
            if let Some(truncate_before) = metadata.truncate_before {
                self.index.record_truncation(&data_stream, truncate_before)?;
            }
        }
        Ok(())
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, WriterCore>, AppendError> {
        self.writer
            .lock()
            .map_err(|_| AppendError::Index(IndexError::LockPoisoned))
    }
}

enum VersionCheck {
    Proceed,
    Idempotent(AppendOutcome),
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
