//! In-memory tier of the stream index.

use std::collections::{BTreeMap, HashMap};

use crate::core::StreamId;

use super::ptable::PTableEntry;

/// Sorted map from (stream-hash, event-number) to candidate log positions,
/// plus the exact stream names seen per hash for collision disambiguation.
/// A key holds more than one position only when two live streams collide on
/// the 64-bit hash.
#[derive(Default)]
pub(crate) struct MemTable {
    entries: BTreeMap<(u64, i64), Vec<i64>>,
    names: HashMap<u64, Vec<StreamId>>,
    total: usize,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Record an entry. Re-inserting an identical (key, position) pair is a
    /// no-op so idempotent replays stay cheap.
    pub fn insert(&mut self, hash: u64, stream: &StreamId, event_number: i64, position: i64) {
        let names = self.names.entry(hash).or_default();
        if !names.iter().any(|name| name == stream) {
            names.push(stream.clone());
        }

        let positions = self.entries.entry((hash, event_number)).or_default();
        if !positions.contains(&position) {
            positions.push(position);
            self.total += 1;
        }
    }

    /// Candidate positions for an exact key, unverified.
    pub fn get(&self, hash: u64, event_number: i64) -> &[i64] {
        self.entries
            .get(&(hash, event_number))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Stream names observed for a hash since startup.
    pub fn names_for(&self, hash: u64) -> &[StreamId] {
        self.names.get(&hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Entries for a hash within `[from, to]`, ascending by event number.
    pub fn range(&self, hash: u64, from: i64, to: i64) -> Vec<(i64, i64)> {
        if from > to {
            return Vec::new();
        }
        self.entries
            .range((hash, from)..=(hash, to))
            .flat_map(|((_, event_number), positions)| {
                positions.iter().map(move |pos| (*event_number, *pos))
            })
            .collect()
    }

    /// Highest entry for a hash, if any.
    pub fn max_entry(&self, hash: u64) -> Option<(i64, Vec<i64>)> {
        self.entries
            .range((hash, i64::MIN)..=(hash, i64::MAX))
            .next_back()
            .map(|((_, event_number), positions)| (*event_number, positions.clone()))
    }

    /// Highest entry for a hash strictly below `bound`.
    pub fn max_entry_below(&self, hash: u64, bound: i64) -> Option<(i64, Vec<i64>)> {
        self.entries
            .range((hash, i64::MIN)..(hash, bound))
            .next_back()
            .map(|((_, event_number), positions)| (*event_number, positions.clone()))
    }

    /// Drain into sorted table entries for a flush.
    pub fn to_entries(&self) -> Vec<PTableEntry> {
        self.entries
            .iter()
            .flat_map(|((hash, event_number), positions)| {
                positions.iter().map(move |pos| PTableEntry {
                    stream_hash: *hash,
                    event_number: *event_number,
                    position: *pos,
                })
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total = 0;
        // `names` survives flushes: disambiguation is cheap and the map only
        // grows with live streams.
    }
}
