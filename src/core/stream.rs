//! Stream identity, event numbering, and expected-version sentinels.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix marking a system stream.
pub const SYSTEM_STREAM_PREFIX: char = '$';
/// Prefix of the metadata stream for a given stream.
pub const METADATA_STREAM_PREFIX: &str = "$$";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamIdError {
    #[error("stream id cannot be empty")]
    Empty,
    #[error("stream id exceeds {max} bytes (got {got})")]
    TooLong { max: usize, got: usize },
}

const MAX_STREAM_ID_BYTES: usize = 4096;

/// Non-empty UTF-8 stream name. Names starting with `$` are system streams;
/// the metadata stream for `S` is `$$S`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn parse(name: impl Into<String>) -> Result<Self, StreamIdError> {
        let name = name.into();
        if name.is_empty() {
            return Err(StreamIdError::Empty);
        }
        if name.len() > MAX_STREAM_ID_BYTES {
            return Err(StreamIdError::TooLong {
                max: MAX_STREAM_ID_BYTES,
                got: name.len(),
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_system(&self) -> bool {
        self.0.starts_with(SYSTEM_STREAM_PREFIX)
    }

    pub fn is_metadata(&self) -> bool {
        self.0.starts_with(METADATA_STREAM_PREFIX)
    }

    /// The `$$S` metadata stream for this stream.
    pub fn metadata_stream(&self) -> StreamId {
        StreamId(format!("{METADATA_STREAM_PREFIX}{}", self.0))
    }

    /// The stream a metadata stream describes, if this is one.
    pub fn data_stream(&self) -> Option<StreamId> {
        self.0
            .strip_prefix(METADATA_STREAM_PREFIX)
            .filter(|rest| !rest.is_empty())
            .map(|rest| StreamId(rest.to_string()))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dense, zero-based position of an event within its stream.
#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EventNumber(i64);

impl EventNumber {
    pub const ZERO: EventNumber = EventNumber(0);
    /// Event number written by a hard-delete tombstone.
    pub const TOMBSTONE: EventNumber = EventNumber(i64::MAX);

    pub fn new(value: i64) -> Option<Self> {
        (value >= 0).then_some(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn next(self) -> EventNumber {
        EventNumber(self.0.saturating_add(1))
    }

    pub fn prev(self) -> Option<EventNumber> {
        (self.0 > 0).then(|| EventNumber(self.0 - 1))
    }
}

impl fmt::Display for EventNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller's claim about a stream's tail at write time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No concurrency check.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream must exist with at least one event.
    StreamExists,
    /// The stream's tail must be exactly this event number.
    Exact(EventNumber),
}

const EXPECTED_ANY: i64 = -2;
const EXPECTED_NO_STREAM: i64 = -1;
const EXPECTED_STREAM_EXISTS: i64 = -4;

impl ExpectedVersion {
    /// Wire encoding: `Any = -2`, `NoStream = -1`, `StreamExists = -4`,
    /// `Exact(n) = n`.
    pub fn encode(self) -> i64 {
        match self {
            ExpectedVersion::Any => EXPECTED_ANY,
            ExpectedVersion::NoStream => EXPECTED_NO_STREAM,
            ExpectedVersion::StreamExists => EXPECTED_STREAM_EXISTS,
            ExpectedVersion::Exact(n) => n.get(),
        }
    }

    pub fn decode(raw: i64) -> Option<Self> {
        match raw {
            EXPECTED_ANY => Some(ExpectedVersion::Any),
            EXPECTED_NO_STREAM => Some(ExpectedVersion::NoStream),
            EXPECTED_STREAM_EXISTS => Some(ExpectedVersion::StreamExists),
            n => EventNumber::new(n).map(ExpectedVersion::Exact),
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::NoStream => f.write_str("no-stream"),
            ExpectedVersion::StreamExists => f.write_str("stream-exists"),
            ExpectedVersion::Exact(n) => write!(f, "exact({n})"),
        }
    }
}

/// What the index knows about a stream's tail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurrentVersion {
    NoStream,
    Deleted,
    Version(EventNumber),
}

impl CurrentVersion {
    pub fn as_event_number(self) -> Option<EventNumber> {
        match self {
            CurrentVersion::Version(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for CurrentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurrentVersion::NoStream => f.write_str("no-stream"),
            CurrentVersion::Deleted => f.write_str("deleted"),
            CurrentVersion::Version(n) => write!(f, "{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_rejects_empty() {
        assert_eq!(StreamId::parse(""), Err(StreamIdError::Empty));
    }

    #[test]
    fn metadata_stream_roundtrip() {
        let stream = StreamId::parse("orders-1").unwrap();
        let meta = stream.metadata_stream();
        assert_eq!(meta.as_str(), "$$orders-1");
        assert!(meta.is_metadata());
        assert!(meta.is_system());
        assert_eq!(meta.data_stream(), Some(stream.clone()));
        assert_eq!(stream.data_stream(), None);
    }

    #[test]
    fn system_streams_detected() {
        assert!(StreamId::parse("$all").unwrap().is_system());
        assert!(!StreamId::parse("orders").unwrap().is_system());
        assert!(!StreamId::parse("$all").unwrap().is_metadata());
    }

    #[test]
    fn expected_version_encoding_roundtrips() {
        for expected in [
            ExpectedVersion::Any,
            ExpectedVersion::NoStream,
            ExpectedVersion::StreamExists,
            ExpectedVersion::Exact(EventNumber::new(7).unwrap()),
        ] {
            assert_eq!(ExpectedVersion::decode(expected.encode()), Some(expected));
        }
        assert_eq!(ExpectedVersion::decode(-3), None);
    }

    #[test]
    fn event_number_navigation() {
        let n = EventNumber::new(3).unwrap();
        assert_eq!(n.next().get(), 4);
        assert_eq!(n.prev().unwrap().get(), 2);
        assert_eq!(EventNumber::ZERO.prev(), None);
        assert_eq!(EventNumber::new(-1), None);
    }
}
