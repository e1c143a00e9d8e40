//! Persistent subscriptions: server-tracked competing-consumer groups.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::append::{AppendError, BusError};
use crate::core::{EventNumber, StreamId};
use crate::error::Transience;
use crate::reader::ReadError;

mod engine;
mod group;

pub use engine::{ConsumerSession, PersistentSubscriptions, SessionEvent};

pub type PersistentResult<T> = Result<T, PersistentError>;

/// Stream holding group configuration events.
pub const CONFIG_STREAM: &str = "$persistentsubscription-config";
/// Event type of configuration events.
pub const CONFIG_EVENT_TYPE: &str = "$psub-config";
/// Event type of checkpoint events.
pub const CHECKPOINT_EVENT_TYPE: &str = "$checkpoint";

pub(crate) fn checkpoint_stream(stream: &StreamId, group: &str) -> StreamId {
    StreamId::parse(format!(
        "$persistentsubscription-{}::{}-checkpoint",
        stream.as_str(),
        group
    ))
    .expect("non-empty system stream name")
}

pub(crate) fn parked_stream(stream: &StreamId, group: &str) -> StreamId {
    StreamId::parse(format!(
        "$persistentsubscription-{}::{}-parked",
        stream.as_str(),
        group
    ))
    .expect("non-empty system stream name")
}

#[derive(Debug, Error)]
pub enum PersistentError {
    #[error("persistent subscription {stream}::{group} already exists")]
    GroupExists { stream: StreamId, group: String },
    #[error("persistent subscription {stream}::{group} not found")]
    GroupNotFound { stream: StreamId, group: String },
    #[error("persistent subscription {stream}::{group} is full ({max} subscribers)")]
    MaxSubscribersReached {
        stream: StreamId,
        group: String,
        max: usize,
    },
    #[error("persistent subscription settings invalid: {reason}")]
    SettingsInvalid { reason: String },
    #[error("operation timed out")]
    OperationTimeout,
    #[error("persistent subscription engine is shut down")]
    Shutdown,
    #[error(transparent)]
    Append(#[from] AppendError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("persistent subscription registry lock poisoned")]
    LockPoisoned,
}

impl PersistentError {
    pub fn transience(&self) -> Transience {
        match self {
            PersistentError::GroupExists { .. }
            | PersistentError::GroupNotFound { .. }
            | PersistentError::SettingsInvalid { .. }
            | PersistentError::LockPoisoned => Transience::Permanent,
            PersistentError::MaxSubscribersReached { .. }
            | PersistentError::OperationTimeout
            | PersistentError::Shutdown => Transience::Retryable,
            PersistentError::Append(err) => err.transience(),
            PersistentError::Read(err) => err.transience(),
            PersistentError::Bus(_) => Transience::Retryable,
        }
    }
}

/// Where a new group starts reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    /// Only events committed after group creation.
    #[default]
    Live,
    /// The beginning of the stream.
    Beginning,
    /// A specific event number.
    EventNumber(EventNumber),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerStrategy {
    /// Next consumer with free capacity.
    #[default]
    RoundRobin,
    /// Everything to the first connected consumer; failover on disconnect.
    DispatchToSingle,
    /// Hash the correlation id to a consumer, preserving per-correlation
    /// order while that consumer stays connected.
    Pinned,
}

/// Consumer verdict on a delivered event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NackAction {
    Retry,
    Park,
    Skip,
    Stop,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentSettings {
    pub start_from: StartFrom,
    pub resolve_links: bool,
    pub message_timeout_ms: u64,
    pub max_retries: u32,
    pub live_buffer_size: usize,
    pub read_batch_size: usize,
    pub history_buffer_size: usize,
    pub checkpoint_after_ms: u64,
    pub min_checkpoint_count: u64,
    pub max_checkpoint_count: u64,
    /// 0 = unlimited.
    pub max_subscribers: usize,
    /// In-flight events allowed per consumer.
    pub consumer_capacity: usize,
    pub strategy: ConsumerStrategy,
}

impl Default for PersistentSettings {
    fn default() -> Self {
        Self {
            start_from: StartFrom::default(),
            resolve_links: false,
            message_timeout_ms: 30_000,
            max_retries: 10,
            live_buffer_size: 500,
            read_batch_size: 20,
            history_buffer_size: 500,
            checkpoint_after_ms: 2_000,
            min_checkpoint_count: 10,
            max_checkpoint_count: 1_000,
            max_subscribers: 0,
            consumer_capacity: 10,
            strategy: ConsumerStrategy::default(),
        }
    }
}

impl PersistentSettings {
    pub fn validate(&self) -> PersistentResult<()> {
        if self.consumer_capacity == 0 {
            return Err(PersistentError::SettingsInvalid {
                reason: "consumer_capacity must be > 0".to_string(),
            });
        }
        if self.read_batch_size == 0 {
            return Err(PersistentError::SettingsInvalid {
                reason: "read_batch_size must be > 0".to_string(),
            });
        }
        if self.history_buffer_size < self.read_batch_size {
            return Err(PersistentError::SettingsInvalid {
                reason: "history_buffer_size must be >= read_batch_size".to_string(),
            });
        }
        Ok(())
    }
}
