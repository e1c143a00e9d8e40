//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use strand::{
    Config, EventId, EventStore, ExpectedVersion, ProposedEvent, StreamId, Subscription,
    SubscriptionEvent,
};
use uuid::Uuid;

pub fn open_store(dir: &Path) -> EventStore {
    EventStore::open(dir, Config::default()).expect("open store")
}

pub fn stream(name: &str) -> StreamId {
    StreamId::parse(name).expect("valid stream id")
}

/// Deterministic event id from a seed byte.
pub fn seeded_event(seed: u8) -> ProposedEvent {
    ProposedEvent::new(
        EventId::new(Uuid::from_bytes([seed; 16])),
        "test-event",
        Bytes::from_static(b"{\"n\":1}"),
    )
}

pub fn unique_event(event_type: &str) -> ProposedEvent {
    ProposedEvent::new(EventId::generate(), event_type, Bytes::from_static(b"{}"))
}

/// Append `count` single-event batches to a stream.
pub fn append_many(store: &EventStore, stream: &StreamId, count: usize) {
    for _ in 0..count {
        store
            .append(stream, ExpectedVersion::Any, &[unique_event("test-event")])
            .expect("append");
    }
}

/// Collect up to `want` frames within `budget`.
pub fn collect_frames(
    sub: &Subscription,
    want: usize,
    budget: Duration,
) -> Vec<SubscriptionEvent> {
    let deadline = Instant::now() + budget;
    let mut frames = Vec::new();
    while frames.len() < want && Instant::now() < deadline {
        if let Some(frame) = sub.recv_timeout(Duration::from_millis(50)) {
            frames.push(frame);
        }
    }
    frames
}

/// Event numbers of `EventAppeared` frames for one stream.
pub fn appeared_numbers(frames: &[SubscriptionEvent], stream: &StreamId) -> Vec<i64> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            SubscriptionEvent::EventAppeared(resolved)
                if resolved.event.stream == *stream =>
            {
                Some(resolved.event.event_number.get())
            }
            _ => None,
        })
        .collect()
}
