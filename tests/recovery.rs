//! Crash recovery: the index is rebuilt from the log on startup.

mod fixtures;

use std::fs;

use strand::{Config, EventNumber, EventStore, ExpectedVersion};
use tempfile::TempDir;

use fixtures::{open_store, stream, unique_event};

#[test]
fn index_rebuilds_from_log_after_unclean_shutdown() {
    let temp = TempDir::new().unwrap();
    let s = stream("s");

    // Append ten events. Synchronous durability fsyncs the log on every
    // append, but the index memtable is never flushed because the store is
    // dropped without shutdown.
    {
        let store = open_store(temp.path());
        for _ in 0..10 {
            store
                .append(&s, ExpectedVersion::Any, &[unique_event("t")])
                .unwrap();
        }
        drop(store);
    }

    let store = open_store(temp.path());
    let slice = store
        .read_stream_forward(&s, EventNumber::ZERO, 100, false)
        .unwrap()
        .into_slice()
        .expect("stream present after recovery");
    let numbers: Vec<i64> = slice
        .events
        .iter()
        .map(|e| e.event.event_number.get())
        .collect();
    assert_eq!(numbers, (0..10).collect::<Vec<_>>());

    store.shutdown().unwrap();
}

#[test]
fn torn_tail_bytes_are_repaired_and_reported() {
    let temp = TempDir::new().unwrap();
    let s = stream("s");
    {
        let store = open_store(temp.path());
        store
            .append(&s, ExpectedVersion::Any, &[unique_event("t")])
            .unwrap();
        drop(store);
    }

    // Garbage at the tail of the active chunk, as a torn write would leave.
    let chunks_dir = temp.path().join("chunks");
    let chunk = fs::read_dir(&chunks_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("chunk-"))
                .unwrap_or(false)
        })
        .expect("chunk file");
    let mut bytes = fs::read(&chunk).unwrap();
    bytes.extend_from_slice(&[0xDE, 0xAD, 0xBE]);
    fs::write(&chunk, &bytes).unwrap();

    let store = open_store(temp.path());
    let report = store.recovery_report();
    assert!(report.truncated_from.is_some());
    assert_eq!(report.truncated_bytes, 3);

    // The committed event survives.
    let slice = store
        .read_stream_forward(&s, EventNumber::ZERO, 10, false)
        .unwrap()
        .into_slice()
        .unwrap();
    assert_eq!(slice.events.len(), 1);

    store.shutdown().unwrap();
}

#[test]
fn flushed_index_and_checkpoints_survive_clean_restart() {
    let temp = TempDir::new().unwrap();
    let s = stream("persisted");
    {
        let store = open_store(temp.path());
        for _ in 0..25 {
            store
                .append(&s, ExpectedVersion::Any, &[unique_event("t")])
                .unwrap();
        }
        store.shutdown().unwrap();
    }

    let store = EventStore::open(temp.path(), Config::default()).unwrap();
    let slice = store
        .read_stream_forward(&s, EventNumber::ZERO, 100, false)
        .unwrap()
        .into_slice()
        .unwrap();
    assert_eq!(slice.events.len(), 25);

    // Epoch advances across restarts.
    assert!(store.recovery_report().epoch >= 2);

    store.shutdown().unwrap();
}

#[test]
fn recovery_is_idempotent_across_multiple_restarts() {
    let temp = TempDir::new().unwrap();
    let s = stream("stable");
    {
        let store = open_store(temp.path());
        store
            .append(&s, ExpectedVersion::Any, &[unique_event("t")])
            .unwrap();
        drop(store);
    }
    for _ in 0..3 {
        let store = open_store(temp.path());
        let slice = store
            .read_stream_forward(&s, EventNumber::ZERO, 10, false)
            .unwrap()
            .into_slice()
            .unwrap();
        assert_eq!(slice.events.len(), 1);
        drop(store);
    }
}
