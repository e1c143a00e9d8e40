#![forbid(unsafe_code)]

pub mod append;
pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod log;
pub mod psub;
pub mod reader;
mod store;
pub mod sub;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the domain vocabulary at crate root for convenience
pub use crate::core::{
    CurrentVersion, EventFilter, EventId, EventNumber, EventRecord, ExpectedVersion, FilterClause,
    FilterSpec, FilterTarget, Limits, LogPosition, PredicateSpec, ProposedEvent, ResolvedEvent,
    StreamId, StreamMetadata,
};

pub use crate::append::{AppendOutcome, Committed, DeleteOutcome};
pub use crate::config::{Config, DurabilityConfig, WriteMode};
pub use crate::psub::{
    ConsumerSession, ConsumerStrategy, NackAction, PersistentSettings, SessionEvent, StartFrom,
};
pub use crate::reader::{AllSlice, ReadDirection, ReadEventResult, StreamReadOutcome, StreamSlice};
pub use crate::store::EventStore;
pub use crate::sub::{DropReason, Subscription, SubscriptionEvent};
