//! Stream reads: point lookups, slices, metadata enforcement, links.

use crate::core::{
    CurrentVersion, EventNumber, EventRecord, ResolvedEvent, StreamId, StreamMetadata,
};
use crate::index::stream_index::RangeDirection;

use super::{
    now_ms, ReadDirection, ReadEventResult, ReadResult, Reader, StreamReadOutcome, StreamSlice,
};

impl Reader {
    /// Read one event by stream and number.
    pub fn read_event(
        &self,
        stream: &StreamId,
        event_number: EventNumber,
        resolve_links: bool,
    ) -> ReadResult<ReadEventResult> {
        let tail = match self.index().tail(stream)? {
            CurrentVersion::Deleted => return Ok(ReadEventResult::StreamDeleted),
            CurrentVersion::NoStream => return Ok(ReadEventResult::NoStream),
            CurrentVersion::Version(tail) => tail,
        };

        let metadata = self.stream_metadata(stream)?;
        if !self.visible(stream, event_number, tail, &metadata) {
            return Ok(ReadEventResult::NotFound);
        }
        let Some(position) = self.index().lookup(stream, event_number)? else {
            return Ok(ReadEventResult::NotFound);
        };
        let Some(record) = self.materialize(position)? else {
            return Ok(ReadEventResult::NotFound);
        };
        if metadata.is_expired(record.created_ms, now_ms()) {
            return Ok(ReadEventResult::NotFound);
        }

        Ok(ReadEventResult::Found(self.resolve(record, resolve_links)?))
    }

    /// Forward slice starting at `from`.
    pub fn read_stream_forward(
        &self,
        stream: &StreamId,
        from: EventNumber,
        count: usize,
        resolve_links: bool,
    ) -> ReadResult<StreamReadOutcome> {
        let tail = match self.index().tail(stream)? {
            CurrentVersion::Deleted => return Ok(StreamReadOutcome::StreamDeleted),
            CurrentVersion::NoStream => return Ok(StreamReadOutcome::NoStream),
            CurrentVersion::Version(tail) => tail,
        };
        let metadata = self.stream_metadata(stream)?;
        let floor = metadata.visibility_floor(tail);

        if from > tail || count == 0 {
            return Ok(StreamReadOutcome::Slice(StreamSlice {
                events: Vec::new(),
                next_event_number: Some(tail.next()),
                last_event_number: tail,
                is_end_of_stream: true,
                direction: ReadDirection::Forward,
            }));
        }

        let start = from.max(floor);
        let candidates =
            self.index()
                .range(stream, start, count, RangeDirection::Forward)?;
        let events = self.materialize_slice(stream, candidates, &metadata, resolve_links)?;

        let consumed_to = start.get().saturating_add(count as i64);
        let next = consumed_to.min(tail.get() + 1);
        Ok(StreamReadOutcome::Slice(StreamSlice {
            events,
            next_event_number: EventNumber::new(next),
            last_event_number: tail,
            is_end_of_stream: next > tail.get(),
            direction: ReadDirection::Forward,
        }))
    }

    /// Backward slice starting at `from` (clamped to the tail) and walking
    /// toward the first visible event.
    pub fn read_stream_backward(
        &self,
        stream: &StreamId,
        from: EventNumber,
        count: usize,
        resolve_links: bool,
    ) -> ReadResult<StreamReadOutcome> {
        let tail = match self.index().tail(stream)? {
            CurrentVersion::Deleted => return Ok(StreamReadOutcome::StreamDeleted),
            CurrentVersion::NoStream => return Ok(StreamReadOutcome::NoStream),
            CurrentVersion::Version(tail) => tail,
        };
        let metadata = self.stream_metadata(stream)?;
        let floor = metadata.visibility_floor(tail);
        let start = from.min(tail);

        if count == 0 || start < floor {
            return Ok(StreamReadOutcome::Slice(StreamSlice {
                events: Vec::new(),
                next_event_number: None,
                last_event_number: tail,
                is_end_of_stream: true,
                direction: ReadDirection::Backward,
            }));
        }

        let candidates =
            self.index()
                .range(stream, start, count, RangeDirection::Backward)?;
        let mut events =
            self.materialize_slice(stream, candidates, &metadata, resolve_links)?;
        // Backward slices are monotonic-decreasing; drop below-floor strays.
        events.retain(|resolved| resolved.original_event_number() >= floor);

        let next = start.get() - count as i64;
        let next_event_number = if next >= floor.get() {
            EventNumber::new(next)
        } else {
            None
        };
        Ok(StreamReadOutcome::Slice(StreamSlice {
            is_end_of_stream: next_event_number.is_none(),
            events,
            next_event_number,
            last_event_number: tail,
            direction: ReadDirection::Backward,
        }))
    }

    /// The stream's tail version as the index sees it.
    pub fn stream_tail(&self, stream: &StreamId) -> ReadResult<CurrentVersion> {
        Ok(self.index().tail(stream)?)
    }

    fn visible(
        &self,
        _stream: &StreamId,
        event_number: EventNumber,
        tail: EventNumber,
        metadata: &StreamMetadata,
    ) -> bool {
        event_number <= tail && event_number >= metadata.visibility_floor(tail)
    }

    /// Materialize index candidates: collision strays and duplicates are
    /// dropped here, aged-out events are omitted.
    fn materialize_slice(
        &self,
        stream: &StreamId,
        candidates: Vec<(EventNumber, i64)>,
        metadata: &StreamMetadata,
        resolve_links: bool,
    ) -> ReadResult<Vec<ResolvedEvent>> {
        let now = now_ms();
        let mut events = Vec::with_capacity(candidates.len());
        let mut last_number: Option<EventNumber> = None;
        for (event_number, position) in candidates {
            if last_number == Some(event_number) {
                continue;
            }
            let Some(record) = self.materialize(position)? else {
                continue;
            };
            if record.stream != *stream || record.event_number != event_number {
                continue;
            }
            if metadata.is_expired(record.created_ms, now) {
                continue;
            }
            last_number = Some(event_number);
            events.push(self.resolve(record, resolve_links)?);
        }
        Ok(events)
    }

    /// Follow a `$>` link when asked; a missing target comes back with
    /// `is_resolved = false`.
    pub(crate) fn resolve(
        &self,
        record: EventRecord,
        resolve_links: bool,
    ) -> ReadResult<ResolvedEvent> {
        if !resolve_links || !record.is_link() {
            return Ok(ResolvedEvent::direct(record));
        }
        let Some((target_number, target_stream)) = record.link_target() else {
            return Ok(ResolvedEvent {
                event: record,
                link: None,
                is_resolved: false,
            });
        };

        let target = match self.index().tail(&target_stream)? {
            CurrentVersion::Version(tail) if target_number <= tail => {
                match self.index().lookup(&target_stream, target_number)? {
                    Some(position) => self.materialize(position)?,
                    None => None,
                }
            }
            _ => None,
        };

        Ok(match target {
            Some(event) => ResolvedEvent {
                event,
                link: Some(record),
                is_resolved: true,
            },
            None => ResolvedEvent {
                event: record,
                link: None,
                is_resolved: false,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append::{AppendCoordinator, CommitBus};
    use crate::config::DurabilityConfig;
    use crate::core::{EventId, ExpectedVersion, Limits, ProposedEvent};
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

    fn n(value: i64) -> EventNumber {
        EventNumber::new(value).unwrap()
    }

    fn event(id_byte: u8, event_type: &str) -> ProposedEvent {
        ProposedEvent::new(
            EventId::new(Uuid::from_bytes([id_byte; 16])),
            event_type,
            Bytes::from_static(b"data"),
        )
    }

    fn append_n(fx: &Fixture, stream: &StreamId, count: u8) {
        for i in 0..count {
            fx.coordinator
                .append(stream, ExpectedVersion::Any, &[event(i + 1, "t")])
                .unwrap();
        }
    }

    #[test]
    fn forward_read_returns_append_order() {
        let fx = fixture();
        let s = stream("s");
        append_n(&fx, &s, 5);

        let slice = fx
            .reader
            .read_stream_forward(&s, EventNumber::ZERO, 10, false)
            .unwrap()
            .into_slice()
            .unwrap();
        let numbers: Vec<i64> = slice
            .events
            .iter()
            .map(|e| e.event.event_number.get())
            .collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
        assert!(slice.is_end_of_stream);
        assert_eq!(slice.last_event_number.get(), 4);
        assert_eq!(slice.next_event_number, Some(n(5)));
    }

    #[test]
    fn forward_read_pages() {
        let fx = fixture();
        let s = stream("s");
        append_n(&fx, &s, 5);

        let slice = fx
            .reader
            .read_stream_forward(&s, n(1), 2, false)
            .unwrap()
            .into_slice()
            .unwrap();
        let numbers: Vec<i64> = slice
            .events
            .iter()
            .map(|e| e.event.event_number.get())
            .collect();
        assert_eq!(numbers, vec![1, 2]);
        assert!(!slice.is_end_of_stream);
        assert_eq!(slice.next_event_number, Some(n(3)));
    }

    #[test]
    fn backward_read_descends() {
        let fx = fixture();
        let s = stream("s");
        append_n(&fx, &s, 5);

        let slice = fx
            .reader
            .read_stream_backward(&s, n(4), 3, false)
            .unwrap()
            .into_slice()
            .unwrap();
        let numbers: Vec<i64> = slice
            .events
            .iter()
            .map(|e| e.event.event_number.get())
            .collect();
        assert_eq!(numbers, vec![4, 3, 2]);
        assert_eq!(slice.next_event_number, Some(n(1)));
        assert!(!slice.is_end_of_stream);
    }

    #[test]
    fn missing_stream_and_missing_event() {
        let fx = fixture();
        let s = stream("missing");
        assert!(matches!(
            fx.reader.read_event(&s, EventNumber::ZERO, false).unwrap(),
            ReadEventResult::NoStream
        ));

        append_n(&fx, &s, 1);
        assert!(matches!(
            fx.reader.read_event(&s, n(7), false).unwrap(),
            ReadEventResult::NotFound
        ));
    }

    #[test]
    fn deleted_stream_surfaces_everywhere() {
        let fx = fixture();
        let s = stream("gone");
        append_n(&fx, &s, 1);
        fx.coordinator
            .delete_stream(&s, ExpectedVersion::Any, true)
            .unwrap();

        assert!(matches!(
            fx.reader.read_event(&s, EventNumber::ZERO, false).unwrap(),
            ReadEventResult::StreamDeleted
        ));
        assert!(matches!(
            fx.reader
                .read_stream_forward(&s, EventNumber::ZERO, 10, false)
                .unwrap(),
            StreamReadOutcome::StreamDeleted
        ));
    }

    #[test]
    fn truncate_before_hides_prefix_without_renumbering() {
        let fx = fixture();
        let s = stream("trunc");
        append_n(&fx, &s, 5);
        fx.coordinator
            .set_stream_metadata(
                &s,
                ExpectedVersion::Any,
                &StreamMetadata {
                    truncate_before: Some(n(3)),
                    ..StreamMetadata::default()
                },
            )
            .unwrap();

        let slice = fx
            .reader
            .read_stream_forward(&s, EventNumber::ZERO, 10, false)
            .unwrap()
            .into_slice()
            .unwrap();
        let numbers: Vec<i64> = slice
            .events
            .iter()
            .map(|e| e.event.event_number.get())
            .collect();
        assert_eq!(numbers, vec![3, 4]);

        assert!(matches!(
            fx.reader.read_event(&s, n(1), false).unwrap(),
            ReadEventResult::NotFound
        ));
    }

    #[test]
    fn max_count_keeps_only_the_tail() {
        let fx = fixture();
        let s = stream("capped");
        append_n(&fx, &s, 6);
        fx.coordinator
            .set_stream_metadata(
                &s,
                ExpectedVersion::Any,
                &StreamMetadata {
                    max_count: Some(2),
                    ..StreamMetadata::default()
                },
            )
            .unwrap();

        let slice = fx
            .reader
            .read_stream_forward(&s, EventNumber::ZERO, 10, false)
            .unwrap()
            .into_slice()
            .unwrap();
        let numbers: Vec<i64> = slice
            .events
            .iter()
            .map(|e| e.event.event_number.get())
            .collect();
        assert_eq!(numbers, vec![4, 5]);
    }

    #[test]
    fn link_events_resolve_to_target() {
        let fx = fixture();
        let target = stream("target");
        append_n(&fx, &target, 3);

        let links = stream("links");
        fx.coordinator
            .append(
                &links,
                ExpectedVersion::Any,
                &[ProposedEvent::link(
                    EventId::new(Uuid::from_bytes([50u8; 16])),
                    n(1),
                    &target,
                )],
            )
            .unwrap();

        let resolved = match fx.reader.read_event(&links, EventNumber::ZERO, true).unwrap() {
            ReadEventResult::Found(resolved) => resolved,
            other => panic!("expected found, got {other:?}"),
        };
        assert!(resolved.is_resolved);
        assert_eq!(resolved.event.stream, target);
        assert_eq!(resolved.event.event_number, n(1));
        assert_eq!(resolved.original_event_number(), EventNumber::ZERO);

        // Unresolved without the flag.
        let raw = match fx.reader.read_event(&links, EventNumber::ZERO, false).unwrap() {
            ReadEventResult::Found(resolved) => resolved,
            other => panic!("expected found, got {other:?}"),
        };
        assert!(raw.event.is_link());
    }

    #[test]
    fn dangling_link_comes_back_unresolved() {
        let fx = fixture();
        let links = stream("links");
        fx.coordinator
            .append(
                &links,
                ExpectedVersion::Any,
                &[ProposedEvent::link(
                    EventId::new(Uuid::from_bytes([51u8; 16])),
                    n(9),
                    &stream("nowhere"),
                )],
            )
            .unwrap();

        let resolved = match fx.reader.read_event(&links, EventNumber::ZERO, true).unwrap() {
            ReadEventResult::Found(resolved) => resolved,
            other => panic!("expected found, got {other:?}"),
        };
        assert!(!resolved.is_resolved);
        assert!(resolved.event.is_link());
    }

    #[test]
    fn read_past_tail_is_end_of_stream() {
        let fx = fixture();
        let s = stream("s");
        append_n(&fx, &s, 2);
        let slice = fx
            .reader
            .read_stream_forward(&s, n(10), 5, false)
            .unwrap()
            .into_slice()
            .unwrap();
        assert!(slice.events.is_empty());
        assert!(slice.is_end_of_stream);
        assert_eq!(slice.last_event_number.get(), 1);
    }
}
