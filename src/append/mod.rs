//! Append coordination: expected-version enforcement, the single writer
//! path, and commit publication.

pub mod commit_bus;
pub mod coordinator;

pub use commit_bus::{BusDropReason, BusError, BusSubscription, CommitBus, Committed};
pub use coordinator::{AppendCoordinator, AppendError, AppendOutcome, DeleteOutcome};

pub type AppendResult<T> = Result<T, AppendError>;
