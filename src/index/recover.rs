//! Log-ahead-of-index repair: replay committed events into the index.

use std::collections::HashMap;

use crate::core::{StreamMetadata, METADATA_EVENT_TYPE};
use crate::log::{LogError, LogReader, LogRecord, PrepareLog};

use super::stream_index::{RecordResolver, StreamIndex};
use super::IndexResult;

impl RecordResolver for LogReader {
    fn stream_at(&self, position: i64) -> IndexResult<Option<crate::core::StreamId>> {
        match self.read_at(position) {
            Ok(at) => match at.record {
                LogRecord::Prepare(prepare) => Ok(Some(prepare.stream)),
                _ => Ok(None),
            },
            Err(LogError::PositionOutOfRange { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub records_scanned: u64,
    pub events_indexed: u64,
    pub tombstones: u64,
    pub metadata_updates: u64,
}

/// Scan `[from, to)` and index every committed event found. Prepares of
/// explicit transactions are buffered until their commit record; an
/// uncommitted tail transaction is ignored (recovery truncates it or the
/// commit arrives later).
pub fn catch_up_index(
    reader: &LogReader,
    index: &StreamIndex,
    from: i64,
    to: i64,
) -> IndexResult<ReplayStats> {
    let mut stats = ReplayStats::default();
    let mut pending: HashMap<i64, Vec<(PrepareLog, i64)>> = HashMap::new();

    for item in reader.scan_forward(from, to) {
        let at = item?;
        stats.records_scanned += 1;
        match at.record {
            LogRecord::Prepare(prepare) => {
                if prepare.is_implicit_commit() {
                    apply_event(index, &prepare, at.position, &mut stats)?;
                } else {
                    pending
                        .entry(prepare.transaction_position)
                        .or_default()
                        .push((prepare, at.position));
                }
            }
            LogRecord::Commit(commit) => {
                if let Some(prepares) = pending.remove(&commit.transaction_position) {
                    for (prepare, position) in prepares {
                        apply_event(index, &prepare, position, &mut stats)?;
                    }
                }
            }
            LogRecord::System(_) => {}
        }
    }

    index.set_covered(to)?;
    if stats.events_indexed > 0 || stats.tombstones > 0 {
        tracing::info!(
            from,
            to,
            events = stats.events_indexed,
            tombstones = stats.tombstones,
            "index caught up with log"
        );
    }
    Ok(stats)
}

fn apply_event(
    index: &StreamIndex,
    prepare: &PrepareLog,
    position: i64,
    stats: &mut ReplayStats,
) -> IndexResult<()> {
    if prepare.is_tombstone() {
        index.mark_deleted(&prepare.stream, position)?;
        stats.tombstones += 1;
        return Ok(());
    }

    index.insert(&prepare.stream, prepare.event_number, position)?;
    stats.events_indexed += 1;

    if prepare.stream.is_metadata() && prepare.event_type == METADATA_EVENT_TYPE {
        if let Ok(metadata) = StreamMetadata::from_json_bytes(&prepare.data) {
            if let (Some(truncate_before), Some(data_stream)) =
                (metadata.truncate_before, prepare.stream.data_stream())
            {
                index.record_truncation(&data_stream, truncate_before)?;
                stats.metadata_updates += 1;
            }
        }
    }
    Ok(())
}
