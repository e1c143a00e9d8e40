//! Operational limits and tunables.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Limits {
    /// Max bytes of record frames per chunk before rotation.
    pub chunk_max_bytes: u64,
    /// Max encoded size of a single log record.
    pub max_record_bytes: usize,
    /// Memtable entries held before flushing a new index table.
    pub memtable_max_entries: usize,
    /// Index table count that triggers a background merge.
    pub ptable_merge_threshold: usize,
    /// Entries between midpoints in an index table.
    pub ptable_midpoint_interval: usize,
    /// Events per read slice used by catch-up and persistent reads.
    pub read_batch_size: usize,
    /// Default record scan budget for filtered all reads.
    pub max_search_window: usize,
    /// Commit-bus events buffered per subscriber.
    pub subscription_queue_events: usize,
    /// Commit-bus bytes buffered per subscriber.
    pub subscription_queue_bytes: usize,
    /// Live events buffered while a catch-up subscription closes its gap.
    pub live_buffer_size: usize,
    /// Max concurrent subscribers on the commit bus.
    pub max_subscribers: usize,
    /// TTL of cached stream metadata, overridable per stream.
    pub metadata_cache_ttl_ms: u64,
    /// Wakeup interval for persistent-subscription timeout processing.
    pub tick_interval_ms: u64,
    /// Deadline for blocking queue operations.
    pub operation_timeout_ms: u64,
    /// Unflushed bytes tolerated in batched durability mode.
    pub batch_flush_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            chunk_max_bytes: 256 * 1024 * 1024,
            max_record_bytes: 16 * 1024 * 1024,
            memtable_max_entries: 1_000_000,
            ptable_merge_threshold: 8,
            ptable_midpoint_interval: 128,
            read_batch_size: 500,
            max_search_window: 10_000,
            subscription_queue_events: 512,
            subscription_queue_bytes: 4 * 1024 * 1024,
            live_buffer_size: 512,
            max_subscribers: 2_048,
            metadata_cache_ttl_ms: 1_000,
            tick_interval_ms: 20,
            operation_timeout_ms: 5_000,
            batch_flush_bytes: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_json() {
        let limits = Limits::default();
        let json = serde_json::to_string(&limits).unwrap();
        let back: Limits = serde_json::from_str(&json).unwrap();
        assert_eq!(back, limits);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let limits: Limits = serde_json::from_str(r#"{"read_batch_size": 32}"#).unwrap();
        assert_eq!(limits.read_batch_size, 32);
        assert_eq!(limits.chunk_max_bytes, Limits::default().chunk_max_bytes);
    }
}
