//! Optimistic concurrency and idempotent replay, end to end.

mod fixtures;

use strand::append::AppendError;
use strand::{CurrentVersion, Error, EventNumber, ExpectedVersion, StreamReadOutcome};
use tempfile::TempDir;

use fixtures::{open_store, seeded_event, stream, unique_event};

#[test]
fn optimistic_concurrency_sequence() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path());
    let orders = stream("orders-1");

    let first = store
        .append(&orders, ExpectedVersion::NoStream, &[unique_event("placed")])
        .unwrap();
    assert_eq!(first.first_event_number, EventNumber::ZERO);

    let err = store
        .append(&orders, ExpectedVersion::NoStream, &[unique_event("placed")])
        .unwrap_err();
    match err {
        Error::Append(AppendError::WrongExpectedVersion { current, .. }) => {
            assert_eq!(current, CurrentVersion::Version(EventNumber::ZERO));
        }
        other => panic!("expected wrong expected version, got {other:?}"),
    }

    let second = store
        .append(
            &orders,
            ExpectedVersion::Exact(EventNumber::ZERO),
            &[unique_event("shipped")],
        )
        .unwrap();
    assert_eq!(second.first_event_number.get(), 1);

    store.shutdown().unwrap();
}

#[test]
fn idempotent_replay_writes_bytes_once() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path());
    let s = stream("s");
    let batch = [seeded_event(1), seeded_event(2)];

    let first = store
        .append(&s, ExpectedVersion::NoStream, &batch)
        .unwrap();
    assert_eq!(first.first_event_number, EventNumber::ZERO);
    let head = store.head_position();

    let replay = store
        .append(&s, ExpectedVersion::NoStream, &batch)
        .unwrap();
    assert_eq!(replay.first_event_number, EventNumber::ZERO);
    assert!(replay.idempotent);
    assert_eq!(store.head_position(), head, "no new log bytes");

    let slice = store
        .read_stream_forward(&s, EventNumber::ZERO, 10, false)
        .unwrap()
        .into_slice()
        .unwrap();
    assert_eq!(slice.events.len(), 2);

    store.shutdown().unwrap();
}

#[test]
fn idempotent_replay_reports_matching_positions() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path());
    let s = stream("s");
    let batch = [seeded_event(9)];

    let first = store.append(&s, ExpectedVersion::NoStream, &batch).unwrap();
    let replay = store.append(&s, ExpectedVersion::NoStream, &batch).unwrap();
    assert_eq!(replay.position, first.position);
    assert_eq!(replay.last_event_number, first.last_event_number);

    store.shutdown().unwrap();
}

#[test]
fn append_order_equals_read_order() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path());
    let s = stream("ordered");

    for i in 0..20u8 {
        store
            .append(&s, ExpectedVersion::Any, &[seeded_event(i + 1)])
            .unwrap();
    }

    let slice = store
        .read_stream_forward(&s, EventNumber::ZERO, 100, false)
        .unwrap()
        .into_slice()
        .unwrap();
    let numbers: Vec<i64> = slice
        .events
        .iter()
        .map(|e| e.event.event_number.get())
        .collect();
    assert_eq!(numbers, (0..20).collect::<Vec<_>>());

    // Positions strictly increase along the stream.
    let positions: Vec<_> = slice.events.iter().map(|e| e.event.position).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    store.shutdown().unwrap();
}

#[test]
fn hard_delete_is_terminal() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path());
    let s = stream("doomed");

    store
        .append(&s, ExpectedVersion::Any, &[unique_event("t")])
        .unwrap();
    store
        .delete_stream(&s, ExpectedVersion::Any, true)
        .unwrap();

    assert!(matches!(
        store.append(&s, ExpectedVersion::Any, &[unique_event("t")]),
        Err(Error::Append(AppendError::StreamDeleted { .. }))
    ));
    assert!(matches!(
        store
            .read_stream_forward(&s, EventNumber::ZERO, 10, false)
            .unwrap(),
        StreamReadOutcome::StreamDeleted
    ));
    assert_eq!(store.stream_tail(&s).unwrap(), CurrentVersion::Deleted);

    store.shutdown().unwrap();
}
