//! Domain vocabulary shared by every subsystem.

pub mod event;
pub mod filter;
pub mod limits;
pub mod metadata;
pub mod position;
pub mod stream;

pub use event::{EventId, EventRecord, ProposedEvent, ResolvedEvent, LINK_EVENT_TYPE};
pub use filter::{
    EventFilter, FilterClause, FilterError, FilterSpec, FilterTarget, PredicateSpec,
};
pub use limits::Limits;
pub use metadata::{StreamMetadata, METADATA_EVENT_TYPE};
pub use position::LogPosition;
pub use stream::{CurrentVersion, EventNumber, ExpectedVersion, StreamId, StreamIdError};
