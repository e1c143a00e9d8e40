//! K-way merge of index tables.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;

use super::ptable::{PTable, PTableEntry, PTableIter};
use super::{IndexResult, Manifest};

/// Tombstone marker entries use the max event number.
const TOMBSTONE_EVENT_NUMBER: i64 = i64::MAX;

/// Decides which entries survive a merge. Entries of hard-deleted streams and
/// entries below a stream's truncation watermark are dropped; the tombstone
/// markers themselves survive so deletion stays visible.
pub(crate) struct MergePolicy<'a> {
    pub tombstoned: &'a HashSet<u64>,
    pub truncated: &'a HashMap<u64, i64>,
}

impl MergePolicy<'_> {
    fn keep(&self, entry: &PTableEntry) -> bool {
        if entry.event_number == TOMBSTONE_EVENT_NUMBER {
            return true;
        }
        if self.tombstoned.contains(&entry.stream_hash) {
            return false;
        }
        match self.truncated.get(&entry.stream_hash) {
            Some(truncate_before) => entry.event_number >= *truncate_before,
            None => true,
        }
    }
}

struct HeapItem {
    entry: PTableEntry,
    /// Higher = newer table; ties on key prefer the newest.
    source: usize,
    iter: PTableIter,
}

impl HeapItem {
    fn sort_key(&self) -> (u64, i64, Reverse<usize>) {
        (
            self.entry.stream_hash,
            self.entry.event_number,
            Reverse(self.source),
        )
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Merge `tables` (oldest to newest) into one new table at `dir`, applying
/// the scavenge policy. Exact duplicates collapse; distinct positions for
/// the same key (hash collisions) are all retained.
pub(crate) fn merge_tables(
    dir: &Path,
    generation: u64,
    tables: &[std::sync::Arc<PTable>],
    policy: &MergePolicy<'_>,
    midpoint_interval: usize,
) -> IndexResult<PTable> {
    let mut heap: BinaryHeap<Reverse<HeapItem>> = BinaryHeap::new();
    for (source, table) in tables.iter().enumerate() {
        let mut iter = table.iter()?;
        if let Some(first) = iter.next() {
            heap.push(Reverse(HeapItem {
                entry: first?,
                source,
                iter,
            }));
        }
    }

    let mut merged: Vec<PTableEntry> = Vec::new();
    while let Some(Reverse(mut item)) = heap.pop() {
        let entry = item.entry;
        if let Some(next) = item.iter.next() {
            item.entry = next?;
            heap.push(Reverse(item));
        }

        if merged.last() == Some(&entry) {
            continue;
        }
        if policy.keep(&entry) {
            merged.push(entry);
        }
    }

    let path = dir.join(Manifest::table_file_name(generation));
    let table = PTable::write(&path, &merged, midpoint_interval)?;
    tracing::info!(
        generation,
        tables = tables.len(),
        entries = table.entry_count(),
        "index tables merged"
    );
    Ok(table)
}
