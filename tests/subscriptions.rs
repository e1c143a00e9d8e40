//! Catch-up subscriptions crossing the live boundary, and filtered
//! all-stream checkpointing.

mod fixtures;

use std::time::Duration;

use strand::{
    EventNumber, ExpectedVersion, FilterClause, FilterSpec, LogPosition, SubscriptionEvent,
};
use tempfile::TempDir;

use fixtures::{appeared_numbers, collect_frames, open_store, stream, unique_event};

#[test]
fn catch_up_crosses_live_boundary_exactly_once() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path());
    let s = stream("s");

    // Pre-populate 1,000 events in batches.
    for _ in 0..20 {
        let batch: Vec<_> = (0..50).map(|_| unique_event("t")).collect();
        store.append(&s, ExpectedVersion::Any, &batch).unwrap();
    }

    let sub = store
        .subscribe_stream_from(&s, Some(EventNumber::new(500).unwrap()), false)
        .unwrap();

    // Concurrently append events 1000..1099 while the subscription drains.
    for _ in 0..2 {
        let batch: Vec<_> = (0..50).map(|_| unique_event("t")).collect();
        store.append(&s, ExpectedVersion::Any, &batch).unwrap();
    }

    // 599 events (501..=1099) plus the live marker.
    let frames = collect_frames(&sub, 600, Duration::from_secs(15));
    let numbers = appeared_numbers(&frames, &s);
    assert_eq!(numbers, (501..=1099).collect::<Vec<_>>());

    let marker_index = frames
        .iter()
        .position(|f| matches!(f, SubscriptionEvent::LiveProcessingStarted))
        .expect("live marker emitted");
    // The marker arrives after catch-up and before the feed ends.
    assert!(marker_index > 0);

    sub.unsubscribe();
    store.shutdown().unwrap();
}

#[test]
fn filtered_all_subscription_checkpoints_past_nonmatching_ranges() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path());

    // 1,000 events, 7 of which land on billing streams.
    let billing = stream("billing-7");
    let noise = stream("noise");
    let mut matching_positions = Vec::new();
    for i in 0..1_000u32 {
        let target = if i % 143 == 0 { &billing } else { &noise };
        let outcome = store
            .append(target, ExpectedVersion::Any, &[unique_event("t")])
            .unwrap();
        if target == &billing {
            matching_positions.push(outcome.position);
        }
    }
    assert_eq!(matching_positions.len(), 7);
    let last_appended = store.head_position();

    let spec = FilterSpec::new(vec![FilterClause::stream_prefix("billing-")]);
    let sub = store.subscribe_all_from(None, Some(&spec), 100).unwrap();

    let frames = collect_frames(&sub, 19, Duration::from_secs(15));
    let appeared = appeared_numbers(&frames, &billing);
    assert_eq!(appeared.len(), 7, "exactly the billing events appear");

    let checkpoints: Vec<LogPosition> = frames
        .iter()
        .filter_map(|frame| match frame {
            SubscriptionEvent::Checkpoint(position) => Some(*position),
            _ => None,
        })
        .collect();
    assert!(
        checkpoints.len() >= 10,
        "expected at least 10 checkpoints, got {}",
        checkpoints.len()
    );
    let mut sorted = checkpoints.clone();
    sorted.sort();
    assert_eq!(checkpoints, sorted, "checkpoint positions non-decreasing");
    assert!(
        *checkpoints.last().unwrap() >= *matching_positions.last().unwrap(),
        "final checkpoint covers the last appended match"
    );
    assert!(*checkpoints.last().unwrap() <= last_appended);

    sub.unsubscribe();
    store.shutdown().unwrap();
}

#[test]
fn live_subscription_drops_nothing_and_stays_ordered() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path());
    let s = stream("live");

    let sub = store.subscribe_stream_live(&s, false).unwrap();
    std::thread::sleep(Duration::from_millis(30));

    for _ in 0..25 {
        store
            .append(&s, ExpectedVersion::Any, &[unique_event("t")])
            .unwrap();
    }

    let frames = collect_frames(&sub, 25, Duration::from_secs(5));
    let numbers = appeared_numbers(&frames, &s);
    assert_eq!(numbers, (0..25).collect::<Vec<_>>());

    sub.unsubscribe();
    assert_eq!(sub.drop_reason(), Some(strand::DropReason::Unsubscribed));
    store.shutdown().unwrap();
}

#[test]
fn all_subscribers_see_every_commit_once_in_position_order() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path());

    for i in 0..30u32 {
        let name = format!("s-{}", i % 3);
        store
            .append(&stream(&name), ExpectedVersion::Any, &[unique_event("t")])
            .unwrap();
    }

    let sub = store.subscribe_all_from(None, None, 0).unwrap();
    let frames = collect_frames(&sub, 31, Duration::from_secs(10));

    let positions: Vec<LogPosition> = frames
        .iter()
        .filter_map(|frame| match frame {
            SubscriptionEvent::EventAppeared(resolved) => Some(resolved.event.position),
            _ => None,
        })
        .collect();
    assert_eq!(positions.len(), 30);
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "strictly increasing log positions"
    );

    sub.unsubscribe();
    store.shutdown().unwrap();
}
