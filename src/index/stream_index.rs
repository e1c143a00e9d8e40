//! The two-tier index facade.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::core::{CurrentVersion, EventNumber, Limits, StreamId};

use super::manifest::Manifest;
use super::memtable::MemTable;
use super::merge::{merge_tables, MergePolicy};
use super::ptable::PTable;
use super::{stream_hash, IndexError, IndexResult};

/// Dereferences a log position to the stream that wrote it, for hash
/// collision verification.
pub trait RecordResolver: Send + Sync {
    fn stream_at(&self, position: i64) -> IndexResult<Option<StreamId>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeDirection {
    Forward,
    Backward,
}

struct IndexState {
    memtable: MemTable,
    /// Oldest to newest.
    tables: Vec<Arc<PTable>>,
    manifest: Manifest,
    covered_to: i64,
    tombstoned: HashSet<u64>,
    truncated: HashMap<u64, i64>,
}

pub struct StreamIndex {
    dir: PathBuf,
    memtable_max_entries: usize,
    merge_threshold: usize,
    midpoint_interval: usize,
    resolver: Arc<dyn RecordResolver>,
    state: RwLock<IndexState>,
}

impl StreamIndex {
    pub fn open(
        dir: &Path,
        limits: &Limits,
        resolver: Arc<dyn RecordResolver>,
    ) -> IndexResult<Self> {
        fs::create_dir_all(dir).map_err(|source| IndexError::io(dir, source))?;
        let manifest = Manifest::load(dir)?.unwrap_or_default();
        let mut tables = Vec::with_capacity(manifest.tables.len());
        for name in &manifest.tables {
            tables.push(Arc::new(PTable::open(&dir.join(name))?));
        }
        let covered_to = manifest.covered_to;
        tracing::info!(
            tables = tables.len(),
            covered_to,
            "stream index opened"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            memtable_max_entries: limits.memtable_max_entries.max(1),
            merge_threshold: limits.ptable_merge_threshold.max(2),
            midpoint_interval: limits.ptable_midpoint_interval,
            resolver,
            state: RwLock::new(IndexState {
                memtable: MemTable::new(),
                tables,
                manifest,
                covered_to,
                tombstoned: HashSet::new(),
                truncated: HashMap::new(),
            }),
        })
    }

    /// Log position below which every committed event is indexed.
    pub fn covered_to(&self) -> IndexResult<i64> {
        Ok(self.read_state()?.covered_to)
    }

    pub fn set_covered(&self, position: i64) -> IndexResult<()> {
        let mut state = self.write_state()?;
        state.covered_to = state.covered_to.max(position);
        Ok(())
    }

    pub fn insert(
        &self,
        stream: &StreamId,
        event_number: EventNumber,
        position: i64,
    ) -> IndexResult<()> {
        let hash = stream_hash(stream);
        let mut state = self.write_state()?;

        let existing = state.memtable.get(hash, event_number.get());
        if !existing.is_empty() && !existing.contains(&position) {
            // Same stream writing a second position for one event number is
            // corruption; a different stream on the same hash is a collision
            // and both entries stand.
            let names = state.memtable.names_for(hash);
            if names.len() == 1 && names[0] == *stream {
                return Err(IndexError::ConflictingEntry {
                    stream: stream.clone(),
                    event_number: event_number.get(),
                    existing: existing[0],
                    new: position,
                });
            }
        }

        state.memtable.insert(hash, stream, event_number.get(), position);
        if state.memtable.len() >= self.memtable_max_entries {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Record a hard delete: a tombstone entry at the max event number.
    pub fn mark_deleted(&self, stream: &StreamId, position: i64) -> IndexResult<()> {
        let hash = stream_hash(stream);
        let mut state = self.write_state()?;
        state.memtable.insert(hash, stream, i64::MAX, position);
        // Scavenge only when the hash unambiguously belongs to this stream.
        if state.memtable.names_for(hash).len() == 1 {
            state.tombstoned.insert(hash);
        }
        Ok(())
    }

    /// Record a truncation watermark for merge-time scavenging.
    pub fn record_truncation(
        &self,
        stream: &StreamId,
        truncate_before: EventNumber,
    ) -> IndexResult<()> {
        let hash = stream_hash(stream);
        let mut state = self.write_state()?;
        if state.memtable.names_for(hash).len() == 1 {
            let entry = state.truncated.entry(hash).or_insert(0);
            *entry = (*entry).max(truncate_before.get());
        }
        Ok(())
    }

    /// Verified lookup: the returned position dereferences to an event of
    /// `stream` at `event_number`.
    pub fn lookup(
        &self,
        stream: &StreamId,
        event_number: EventNumber,
    ) -> IndexResult<Option<i64>> {
        let hash = stream_hash(stream);
        let candidates = {
            let state = self.read_state()?;
            let mut candidates: Vec<i64> =
                state.memtable.get(hash, event_number.get()).to_vec();
            for table in state.tables.iter().rev() {
                for position in table.get(hash, event_number.get())? {
                    if !candidates.contains(&position) {
                        candidates.push(position);
                    }
                }
            }
            candidates
        };

        for position in candidates {
            if self.verify_candidate(stream, position)? {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }

    /// The stream's tail version, tombstone-aware.
    pub fn tail(&self, stream: &StreamId) -> IndexResult<CurrentVersion> {
        let hash = stream_hash(stream);

        let (tombstones, best) = {
            let state = self.read_state()?;
            let mut tombstones: Vec<i64> = state.memtable.get(hash, i64::MAX).to_vec();
            for table in state.tables.iter().rev() {
                for position in table.get(hash, i64::MAX)? {
                    if !tombstones.contains(&position) {
                        tombstones.push(position);
                    }
                }
            }

            let mut best: Vec<(i64, i64)> = Vec::new();
            if let Some((event_number, positions)) =
                state.memtable.max_entry_below(hash, i64::MAX)
            {
                for position in positions {
                    best.push((event_number, position));
                }
            }
            for table in state.tables.iter().rev() {
                if let Some(entry) = table.last_below(hash, i64::MAX)? {
                    best.push((entry.event_number, entry.position));
                }
            }
            best.sort_by(|a, b| b.0.cmp(&a.0));
            (tombstones, best)
        };

        for position in tombstones {
            if self.verify_candidate(stream, position)? {
                return Ok(CurrentVersion::Deleted);
            }
        }

        for (event_number, position) in &best {
            if self.verify_candidate(stream, *position)? {
                let number = EventNumber::new(*event_number).ok_or_else(|| {
                    IndexError::TableInvalid {
                        path: self.dir.clone(),
                        reason: format!("negative event number {event_number} in index"),
                    }
                })?;
                return Ok(CurrentVersion::Version(number));
            }
        }

        // Per-source maxima all belong to a colliding stream: walk the full
        // hash range before concluding the stream does not exist.
        if !best.is_empty() {
            let mut entries = self.collect_range(hash, 0, i64::MAX - 1)?;
            entries.reverse();
            for (event_number, position) in entries {
                if self.verify_candidate(stream, position)? {
                    let number = EventNumber::new(event_number).ok_or_else(|| {
                        IndexError::TableInvalid {
                            path: self.dir.clone(),
                            reason: format!("negative event number {event_number} in index"),
                        }
                    })?;
                    return Ok(CurrentVersion::Version(number));
                }
            }
        }

        Ok(CurrentVersion::NoStream)
    }

    /// Unverified candidate positions for a slice of the stream. Readers
    /// materialize each position and drop hash-collision strays, so entries
    /// here may include other streams on the same hash.
    pub fn range(
        &self,
        stream: &StreamId,
        from: EventNumber,
        count: usize,
        direction: RangeDirection,
    ) -> IndexResult<Vec<(EventNumber, i64)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let hash = stream_hash(stream);
        let entries = match direction {
            RangeDirection::Forward => {
                let to = from.get().saturating_add(count as i64 - 1).min(i64::MAX - 1);
                self.collect_range(hash, from.get(), to)?
            }
            RangeDirection::Backward => {
                let low = (from.get() - count as i64 + 1).max(0);
                let mut entries = self.collect_range(hash, low, from.get())?;
                entries.reverse();
                entries
            }
        };
        entries
            .into_iter()
            .map(|(event_number, position)| {
                EventNumber::new(event_number)
                    .map(|n| (n, position))
                    .ok_or_else(|| IndexError::TableInvalid {
                        path: self.dir.clone(),
                        reason: format!("negative event number {event_number} in index"),
                    })
            })
            .collect()
    }

    /// All entries for a hash in `[from, to]`, ascending, exact duplicates
    /// collapsed.
    fn collect_range(&self, hash: u64, from: i64, to: i64) -> IndexResult<Vec<(i64, i64)>> {
        let state = self.read_state()?;
        let mut entries = state.memtable.range(hash, from, to);
        for table in &state.tables {
            for entry in table.range(hash, from, to)? {
                entries.push((entry.event_number, entry.position));
            }
        }
        drop(state);
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    /// Flush the memtable into a new table and swap the manifest; merge when
    /// the table count crosses the threshold.
    pub fn flush(&self) -> IndexResult<()> {
        let mut state = self.write_state()?;
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut IndexState) -> IndexResult<()> {
        if !state.memtable.is_empty() {
            let entries = state.memtable.to_entries();
            let generation = state.manifest.generation + 1;
            let name = Manifest::table_file_name(generation);
            let table = PTable::write(
                &self.dir.join(&name),
                &entries,
                self.midpoint_interval,
            )?;
            tracing::debug!(
                generation,
                entries = table.entry_count(),
                "memtable flushed"
            );
            state.tables.push(Arc::new(table));
            state.manifest.generation = generation;
            state.manifest.tables.push(name);
            state.memtable.clear();
        }

        state.manifest.covered_to = state.covered_to;
        state.manifest.save(&self.dir)?;

        if state.tables.len() > self.merge_threshold {
            self.merge_locked(state)?;
        }
        Ok(())
    }

    fn merge_locked(&self, state: &mut IndexState) -> IndexResult<()> {
        let generation = state.manifest.generation + 1;
        let policy = MergePolicy {
            tombstoned: &state.tombstoned,
            truncated: &state.truncated,
        };
        let merged = merge_tables(
            &self.dir,
            generation,
            &state.tables,
            &policy,
            self.midpoint_interval,
        )?;

        let old_tables = std::mem::replace(&mut state.tables, vec![Arc::new(merged)]);
        let old_names = std::mem::replace(
            &mut state.manifest.tables,
            vec![Manifest::table_file_name(generation)],
        );
        state.manifest.generation = generation;
        state.manifest.save(&self.dir)?;

        drop(old_tables);
        for name in old_names {
            let path = self.dir.join(&name);
            if let Err(err) = fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %err, "stale table not removed");
            }
        }
        Ok(())
    }

    fn verify_candidate(&self, stream: &StreamId, position: i64) -> IndexResult<bool> {
        Ok(self
            .resolver
            .stream_at(position)?
            .map(|found| found == *stream)
            .unwrap_or(false))
    }

    fn read_state(&self) -> IndexResult<std::sync::RwLockReadGuard<'_, IndexState>> {
        self.state.read().map_err(|_| IndexError::LockPoisoned)
    }

    fn write_state(&self) -> IndexResult<std::sync::RwLockWriteGuard<'_, IndexState>> {
        self.state.write().map_err(|_| IndexError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Resolver backed by a plain map, standing in for the log.
    struct MapResolver {
        records: Mutex<HashMap<i64, StreamId>>,
    }

    impl MapResolver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(HashMap::new()),
            })
        }

        fn put(&self, position: i64, stream: &StreamId) {
            self.records
                .lock()
                .unwrap()
                .insert(position, stream.clone());
        }
    }

    impl RecordResolver for MapResolver {
        fn stream_at(&self, position: i64) -> IndexResult<Option<StreamId>> {
            Ok(self.records.lock().unwrap().get(&position).cloned())
        }
    }

    fn stream(name: &str) -> StreamId {
        StreamId::parse(name).unwrap()
    }

    fn n(value: i64) -> EventNumber {
        EventNumber::new(value).unwrap()
    }

    fn open_index(
        dir: &Path,
        resolver: Arc<MapResolver>,
        limits: &Limits,
    ) -> StreamIndex {
        StreamIndex::open(dir, limits, resolver).unwrap()
    }

    fn insert_events(
        index: &StreamIndex,
        resolver: &MapResolver,
        stream: &StreamId,
        numbers: std::ops::Range<i64>,
        base_position: i64,
    ) {
        for number in numbers {
            let position = base_position + number * 100;
            resolver.put(position, stream);
            index.insert(stream, n(number), position).unwrap();
        }
    }

    #[test]
    fn lookup_and_tail_roundtrip() {
        let temp = tempfile::TempDir::new().unwrap();
        let resolver = MapResolver::new();
        let index = open_index(temp.path(), Arc::clone(&resolver), &Limits::default());
        let s = stream("orders-1");
        insert_events(&index, &resolver, &s, 0..5, 1000);

        assert_eq!(index.lookup(&s, n(3)).unwrap(), Some(1300));
        assert_eq!(index.lookup(&s, n(9)).unwrap(), None);
        assert_eq!(index.tail(&s).unwrap(), CurrentVersion::Version(n(4)));
        assert_eq!(
            index.tail(&stream("missing")).unwrap(),
            CurrentVersion::NoStream
        );
    }

    #[test]
    fn range_returns_slices_both_ways() {
        let temp = tempfile::TempDir::new().unwrap();
        let resolver = MapResolver::new();
        let index = open_index(temp.path(), Arc::clone(&resolver), &Limits::default());
        let s = stream("s");
        insert_events(&index, &resolver, &s, 0..10, 0);

        let forward = index.range(&s, n(3), 4, RangeDirection::Forward).unwrap();
        let numbers: Vec<i64> = forward.iter().map(|(n, _)| n.get()).collect();
        assert_eq!(numbers, vec![3, 4, 5, 6]);

        let backward = index.range(&s, n(6), 4, RangeDirection::Backward).unwrap();
        let numbers: Vec<i64> = backward.iter().map(|(n, _)| n.get()).collect();
        assert_eq!(numbers, vec![6, 5, 4, 3]);
    }

    #[test]
    fn conflicting_insert_for_same_stream_rejected() {
        let temp = tempfile::TempDir::new().unwrap();
        let resolver = MapResolver::new();
        let index = open_index(temp.path(), Arc::clone(&resolver), &Limits::default());
        let s = stream("s");
        resolver.put(100, &s);
        index.insert(&s, n(0), 100).unwrap();
        index.insert(&s, n(0), 100).unwrap();
        assert!(matches!(
            index.insert(&s, n(0), 200),
            Err(IndexError::ConflictingEntry { .. })
        ));
    }

    #[test]
    fn tombstone_shows_deleted() {
        let temp = tempfile::TempDir::new().unwrap();
        let resolver = MapResolver::new();
        let index = open_index(temp.path(), Arc::clone(&resolver), &Limits::default());
        let s = stream("doomed");
        insert_events(&index, &resolver, &s, 0..2, 0);
        resolver.put(5000, &s);
        index.mark_deleted(&s, 5000).unwrap();
        assert_eq!(index.tail(&s).unwrap(), CurrentVersion::Deleted);
    }

    #[test]
    fn flush_survives_reopen() {
        let temp = tempfile::TempDir::new().unwrap();
        let resolver = MapResolver::new();
        let s = stream("persisted");
        {
            let index = open_index(temp.path(), Arc::clone(&resolver), &Limits::default());
            insert_events(&index, &resolver, &s, 0..20, 0);
            index.set_covered(2000).unwrap();
            index.flush().unwrap();
        }
        let index = open_index(temp.path(), Arc::clone(&resolver), &Limits::default());
        assert_eq!(index.covered_to().unwrap(), 2000);
        assert_eq!(index.lookup(&s, n(13)).unwrap(), Some(1300));
        assert_eq!(index.tail(&s).unwrap(), CurrentVersion::Version(n(19)));
    }

    #[test]
    fn small_memtable_triggers_flush_and_merge() {
        let temp = tempfile::TempDir::new().unwrap();
        let resolver = MapResolver::new();
        let limits = Limits {
            memtable_max_entries: 4,
            ptable_merge_threshold: 2,
            ..Limits::default()
        };
        let index = open_index(temp.path(), Arc::clone(&resolver), &limits);
        let s = stream("busy");
        insert_events(&index, &resolver, &s, 0..40, 0);
        index.flush().unwrap();

        for number in 0..40 {
            assert_eq!(
                index.lookup(&s, n(number)).unwrap(),
                Some(number * 100),
                "event {number}"
            );
        }
        assert_eq!(index.tail(&s).unwrap(), CurrentVersion::Version(n(39)));
    }

    #[test]
    fn colliding_streams_resolve_by_verification() {
        // Force a collision by registering both names under one hash: we
        // cannot fabricate real sha collisions, so exercise the candidate
        // walk through the resolver instead.
        let temp = tempfile::TempDir::new().unwrap();
        let resolver = MapResolver::new();
        let index = open_index(temp.path(), Arc::clone(&resolver), &Limits::default());
        let a = stream("a");
        resolver.put(100, &a);
        index.insert(&a, n(0), 100).unwrap();
        // The wrong stream never verifies.
        assert_eq!(index.lookup(&stream("b"), n(0)).unwrap(), None);
        assert_eq!(index.lookup(&a, n(0)).unwrap(), Some(100));
    }
}
