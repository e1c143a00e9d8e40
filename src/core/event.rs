//! Event records, proposed events, and link resolution.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::LogPosition;
use super::stream::{EventNumber, StreamId};

/// Event type of a link event; its data is `<number>@<stream>`.
pub const LINK_EVENT_TYPE: &str = "$>";

/// Client-supplied unique identifier of an event.
#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event offered for appending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposedEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl ProposedEvent {
    pub fn new(event_id: EventId, event_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            is_json: false,
            data,
            metadata: Bytes::new(),
        }
    }

    pub fn json(event_id: EventId, event_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            is_json: true,
            ..Self::new(event_id, event_type, data)
        }
    }

    /// A link event pointing at `number@stream`.
    pub fn link(event_id: EventId, number: EventNumber, stream: &StreamId) -> Self {
        let data = Bytes::from(format!("{}@{}", number.get(), stream));
        Self::new(event_id, LINK_EVENT_TYPE, data)
    }
}

/// A committed, immutable event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub stream: StreamId,
    pub event_number: EventNumber,
    pub event_id: EventId,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
    pub created_ms: u64,
    pub position: LogPosition,
}

impl EventRecord {
    pub fn is_link(&self) -> bool {
        self.event_type == LINK_EVENT_TYPE
    }

    /// Parse the `<number>@<stream>` target of a link event.
    pub fn link_target(&self) -> Option<(EventNumber, StreamId)> {
        if !self.is_link() {
            return None;
        }
        let text = std::str::from_utf8(&self.data).ok()?;
        let (number, stream) = text.split_once('@')?;
        let number = EventNumber::new(number.parse().ok()?)?;
        let stream = StreamId::parse(stream).ok()?;
        Some((number, stream))
    }
}

/// An event as surfaced by reads: the target event plus the link that led to
/// it, when link resolution was requested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedEvent {
    /// The event itself, or the unresolved link when the target is missing.
    pub event: EventRecord,
    /// The link event that was followed, if any.
    pub link: Option<EventRecord>,
    /// False when a link's target could not be resolved.
    pub is_resolved: bool,
}

impl ResolvedEvent {
    pub fn direct(event: EventRecord) -> Self {
        Self {
            event,
            link: None,
            is_resolved: true,
        }
    }

    /// Position of the record the subscription or slice was ordered by: the
    /// link when one was followed, otherwise the event.
    pub fn original_position(&self) -> LogPosition {
        self.link
            .as_ref()
            .map(|link| link.position)
            .unwrap_or(self.event.position)
    }

    pub fn original_event_number(&self) -> EventNumber {
        self.link
            .as_ref()
            .map(|link| link.event_number)
            .unwrap_or(self.event.event_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(event_type: &str, data: &'static [u8]) -> EventRecord {
        EventRecord {
            stream: StreamId::parse("s").unwrap(),
            event_number: EventNumber::ZERO,
            event_id: EventId::new(Uuid::from_bytes([1u8; 16])),
            event_type: event_type.to_string(),
            is_json: false,
            data: Bytes::from_static(data),
            metadata: Bytes::new(),
            created_ms: 1_700_000_000_000,
            position: LogPosition::single(0),
        }
    }

    #[test]
    fn link_target_parses() {
        let link = record(LINK_EVENT_TYPE, b"42@orders-1");
        let (number, stream) = link.link_target().expect("link target");
        assert_eq!(number.get(), 42);
        assert_eq!(stream.as_str(), "orders-1");
    }

    #[test]
    fn link_target_rejects_garbage() {
        assert_eq!(record(LINK_EVENT_TYPE, b"nope").link_target(), None);
        assert_eq!(record(LINK_EVENT_TYPE, b"-1@s").link_target(), None);
        assert_eq!(record("other", b"42@s").link_target(), None);
    }

    #[test]
    fn proposed_link_roundtrips() {
        let stream = StreamId::parse("orders-1").unwrap();
        let proposed = ProposedEvent::link(
            EventId::new(Uuid::from_bytes([2u8; 16])),
            EventNumber::new(7).unwrap(),
            &stream,
        );
        assert_eq!(proposed.event_type, LINK_EVENT_TYPE);
        assert_eq!(proposed.data.as_ref(), b"7@orders-1");
    }
}
