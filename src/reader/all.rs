//! Reads over the global "all" order, with optional filtering.

use std::collections::{HashMap, HashSet};

use crate::core::{EventFilter, EventRecord, LogPosition};
use crate::log::{LogRecord, PrepareLog};

use super::{event_record_from_prepare, AllSlice, ReadResult, Reader};

impl Reader {
    /// Forward read from `from` (inclusive) in commit order. With a filter,
    /// up to `max_count` matches are returned while examining at most
    /// `max_search_window` records; the slice may be empty with an advanced
    /// `next_position` for resumption.
    pub fn read_all_forward(
        &self,
        from: LogPosition,
        max_count: usize,
        filter: Option<&EventFilter>,
        max_search_window: usize,
    ) -> ReadResult<AllSlice> {
        let end = self.log().end_position();
        let start = from.commit.max(self.log().start_position());
        if start >= end || max_count == 0 {
            return Ok(AllSlice {
                events: Vec::new(),
                next_position: from,
                is_end_of_stream: true,
            });
        }

        let mut events: Vec<EventRecord> = Vec::new();
        let mut pending: HashMap<i64, Vec<(PrepareLog, i64)>> = HashMap::new();
        let mut examined = 0usize;
        let mut cursor = start;

        for item in self.log().scan_forward(start, end) {
            let at = item?;
            examined += 1;
            cursor = at.next_position;

            let group: Vec<(PrepareLog, i64, i64)> = match at.record {
                LogRecord::Prepare(prepare) => {
                    if prepare.is_implicit_commit() {
                        vec![(prepare, at.position, at.position)]
                    } else {
                        pending
                            .entry(prepare.transaction_position)
                            .or_default()
                            .push((prepare, at.position));
                        Vec::new()
                    }
                }
                LogRecord::Commit(commit) => {
                    let prepares = match pending.remove(&commit.transaction_position) {
                        Some(prepares) => prepares,
                        // The transaction began before our scan window.
                        None => self.collect_transaction(
                            commit.transaction_position,
                            at.position,
                        )?,
                    };
                    prepares
                        .into_iter()
                        .map(|(prepare, position)| (prepare, position, at.position))
                        .collect()
                }
                LogRecord::System(_) => Vec::new(),
            };

            for (prepare, prepare_position, commit_position) in group {
                let position = LogPosition {
                    commit: commit_position,
                    prepare: prepare_position,
                };
                if position < from {
                    continue;
                }
                if let Some(filter) = filter {
                    if !filter.matches(&prepare.stream, &prepare.event_type) {
                        continue;
                    }
                }
                events.push(event_record_from_prepare(prepare, position));
                if events.len() >= max_count {
                    // Mid-batch stop resumes at prepare granularity.
                    let next_position = LogPosition {
                        commit: commit_position,
                        prepare: prepare_position + 1,
                    };
                    return Ok(AllSlice {
                        events,
                        next_position,
                        is_end_of_stream: false,
                    });
                }
            }

            if examined >= max_search_window {
                return Ok(AllSlice {
                    events,
                    next_position: LogPosition::single(cursor),
                    is_end_of_stream: cursor >= end,
                });
            }
        }

        Ok(AllSlice {
            events,
            next_position: LogPosition::single(end),
            is_end_of_stream: true,
        })
    }

    /// Backward read returning events strictly before `from`, newest first.
    /// Start from [`LogPosition::END`] to read from the head.
    pub fn read_all_backward(
        &self,
        from: LogPosition,
        max_count: usize,
        filter: Option<&EventFilter>,
        max_search_window: usize,
    ) -> ReadResult<AllSlice> {
        let end = self.log().end_position();
        let log_start = self.log().start_position();
        let cursor = if from.commit >= end {
            end
        } else {
            // Re-examine the record at `from.commit`: a partially consumed
            // batch resumes inside it.
            self.log().read_at(from.commit)?.next_position
        };
        if cursor <= log_start || max_count == 0 {
            return Ok(AllSlice {
                events: Vec::new(),
                next_position: from,
                is_end_of_stream: true,
            });
        }

        let mut events: Vec<EventRecord> = Vec::new();
        let mut handled_transactions: HashSet<i64> = HashSet::new();
        let mut examined = 0usize;

        for item in self.log().scan_backward(cursor) {
            let at = item?;
            examined += 1;

            let group: Vec<(PrepareLog, i64, i64)> = match at.record {
                LogRecord::Prepare(prepare) => {
                    if prepare.is_implicit_commit() {
                        vec![(prepare, at.position, at.position)]
                    } else {
                        // Emitted (or skipped) when its commit was scanned.
                        Vec::new()
                    }
                }
                LogRecord::Commit(commit) => {
                    if !handled_transactions.insert(commit.transaction_position) {
                        Vec::new()
                    } else {
                        let mut prepares = self.collect_transaction(
                            commit.transaction_position,
                            at.position,
                        )?;
                        prepares.reverse();
                        prepares
                            .into_iter()
                            .map(|(prepare, position)| (prepare, position, at.position))
                            .collect()
                    }
                }
                LogRecord::System(_) => Vec::new(),
            };

            for (prepare, prepare_position, commit_position) in group {
                let position = LogPosition {
                    commit: commit_position,
                    prepare: prepare_position,
                };
                if position >= from {
                    continue;
                }
                if let Some(filter) = filter {
                    if !filter.matches(&prepare.stream, &prepare.event_type) {
                        continue;
                    }
                }
                events.push(event_record_from_prepare(prepare, position));
                if events.len() >= max_count {
                    let next_position = position;
                    return Ok(AllSlice {
                        events,
                        next_position,
                        is_end_of_stream: false,
                    });
                }
            }

            if examined >= max_search_window {
                return Ok(AllSlice {
                    events,
                    next_position: LogPosition::single(at.position),
                    is_end_of_stream: at.position <= log_start,
                });
            }
        }

        Ok(AllSlice {
            events,
            next_position: LogPosition::START,
            is_end_of_stream: true,
        })
    }

    /// Prepares of an explicit transaction, in prepare order.
    fn collect_transaction(
        &self,
        transaction_position: i64,
        commit_position: i64,
    ) -> ReadResult<Vec<(PrepareLog, i64)>> {
        let mut prepares = Vec::new();
        for item in self.log().scan_forward(transaction_position, commit_position) {
            let at = item?;
            if let LogRecord::Prepare(prepare) = at.record {
                if prepare.transaction_position == transaction_position {
                    prepares.push((prepare, at.position));
                }
            }
        }
        Ok(prepares)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append::{AppendCoordinator, CommitBus};
    use crate::config::DurabilityConfig;
    use crate::core::{
        EventId, EventNumber, ExpectedVersion, FilterClause, FilterSpec, Limits, ProposedEvent,
        StreamId,
    };
    use crate::index::StreamIndex;
    use crate::log::ChunkedLog;
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Fixture {
        _temp: TempDir,
        coordinator: AppendCoordinator,
        reader: Reader,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let limits = Limits::default();
        let (log, _) = ChunkedLog::open(&temp.path().join("log"), &limits).unwrap();
        let log_reader = log.reader();
        let index = Arc::new(
            StreamIndex::open(
                &temp.path().join("index"),
                &limits,
                Arc::new(log_reader.clone()),
            )
            .unwrap(),
        );
        let bus = CommitBus::new(limits.max_subscribers);
        let coordinator = AppendCoordinator::new(
            log,
            Arc::clone(&index),
            bus,
            &DurabilityConfig::default(),
            &limits,
        );
        let reader = Reader::new(log_reader, index, limits);
        Fixture {
            _temp: temp,
            coordinator,
            reader,
        }
    }

    fn stream(name: &str) -> StreamId {
        StreamId::parse(name).unwrap()
    }

    fn event(id_byte: u8) -> ProposedEvent {
        ProposedEvent::new(
            EventId::new(Uuid::from_bytes([id_byte; 16])),
            "t",
            Bytes::from_static(b"data"),
        )
    }

    #[test]
    fn forward_sees_all_streams_in_commit_order() {
        let fx = fixture();
        fx.coordinator
            .append(&stream("a"), ExpectedVersion::Any, &[event(1)])
            .unwrap();
        fx.coordinator
            .append(&stream("b"), ExpectedVersion::Any, &[event(2)])
            .unwrap();
        fx.coordinator
            .append(&stream("a"), ExpectedVersion::Any, &[event(3)])
            .unwrap();

        let slice = fx
            .reader
            .read_all_forward(LogPosition::START, 100, None, 10_000)
            .unwrap();
        let names: Vec<&str> = slice
            .events
            .iter()
            .map(|e| e.stream.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "a"]);
        assert!(slice.is_end_of_stream);

        let positions: Vec<LogPosition> = slice.events.iter().map(|e| e.position).collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn forward_includes_batch_events_at_their_commit() {
        let fx = fixture();
        fx.coordinator
            .append(
                &stream("batch"),
                ExpectedVersion::Any,
                &[event(1), event(2), event(3)],
            )
            .unwrap();

        let slice = fx
            .reader
            .read_all_forward(LogPosition::START, 100, None, 10_000)
            .unwrap();
        assert_eq!(slice.events.len(), 3);
        let commit = slice.events[0].position.commit;
        assert!(slice
            .events
            .iter()
            .all(|e| e.position.commit == commit));
        let prepares: Vec<i64> = slice.events.iter().map(|e| e.position.prepare).collect();
        let mut sorted = prepares.clone();
        sorted.sort();
        assert_eq!(prepares, sorted);
    }

    #[test]
    fn forward_resumes_mid_batch_without_duplicates() {
        let fx = fixture();
        fx.coordinator
            .append(
                &stream("batch"),
                ExpectedVersion::Any,
                &[event(1), event(2), event(3)],
            )
            .unwrap();

        let first = fx
            .reader
            .read_all_forward(LogPosition::START, 2, None, 10_000)
            .unwrap();
        assert_eq!(first.events.len(), 2);
        assert!(!first.is_end_of_stream);

        let second = fx
            .reader
            .read_all_forward(first.next_position, 100, None, 10_000)
            .unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].event_number, EventNumber::new(2).unwrap());
    }

    #[test]
    fn filtered_forward_respects_search_window() {
        let fx = fixture();
        for i in 0..20u8 {
            let name = if i % 5 == 0 { "billing-1" } else { "other" };
            fx.coordinator
                .append(&stream(name), ExpectedVersion::Any, &[event(i + 1)])
                .unwrap();
        }

        let filter =
            EventFilter::compile(&FilterSpec::new(vec![FilterClause::stream_prefix(
                "billing-",
            )]))
            .unwrap();

        // A tiny window may return no matches but must advance the cursor.
        let slice = fx
            .reader
            .read_all_forward(LogPosition::START, 100, Some(&filter), 2)
            .unwrap();
        assert!(slice.events.len() <= 1);
        assert!(slice.next_position > LogPosition::START);

        // Drain with a large window.
        let mut position = LogPosition::START;
        let mut matched = 0;
        loop {
            let slice = fx
                .reader
                .read_all_forward(position, 100, Some(&filter), 10_000)
                .unwrap();
            matched += slice.events.len();
            position = slice.next_position;
            if slice.is_end_of_stream {
                break;
            }
        }
        assert_eq!(matched, 4);
    }

    #[test]
    fn forward_past_head_echoes_position() {
        let fx = fixture();
        fx.coordinator
            .append(&stream("s"), ExpectedVersion::Any, &[event(1)])
            .unwrap();
        let head = fx.reader.end_position();
        let past = LogPosition::single(head.commit + 1_000);
        let slice = fx.reader.read_all_forward(past, 10, None, 1_000).unwrap();
        assert!(slice.events.is_empty());
        assert!(slice.is_end_of_stream);
        assert_eq!(slice.next_position, past);
    }

    #[test]
    fn backward_reads_newest_first() {
        let fx = fixture();
        for i in 0..5u8 {
            fx.coordinator
                .append(&stream("s"), ExpectedVersion::Any, &[event(i + 1)])
                .unwrap();
        }

        let slice = fx
            .reader
            .read_all_backward(LogPosition::END, 3, None, 10_000)
            .unwrap();
        let numbers: Vec<i64> = slice
            .events
            .iter()
            .map(|e| e.event_number.get())
            .collect();
        assert_eq!(numbers, vec![4, 3, 2]);
        assert!(!slice.is_end_of_stream);

        let rest = fx
            .reader
            .read_all_backward(slice.next_position, 100, None, 10_000)
            .unwrap();
        let numbers: Vec<i64> = rest
            .events
            .iter()
            .map(|e| e.event_number.get())
            .collect();
        assert_eq!(numbers, vec![1, 0]);
        assert!(rest.is_end_of_stream);
    }

    #[test]
    fn backward_handles_batches() {
        let fx = fixture();
        fx.coordinator
            .append(
                &stream("batch"),
                ExpectedVersion::Any,
                &[event(1), event(2)],
            )
            .unwrap();
        fx.coordinator
            .append(&stream("single"), ExpectedVersion::Any, &[event(3)])
            .unwrap();

        let slice = fx
            .reader
            .read_all_backward(LogPosition::END, 100, None, 10_000)
            .unwrap();
        let labels: Vec<(String, i64)> = slice
            .events
            .iter()
            .map(|e| (e.stream.as_str().to_string(), e.event_number.get()))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("single".to_string(), 0),
                ("batch".to_string(), 1),
                ("batch".to_string(), 0),
            ]
        );
    }
}
